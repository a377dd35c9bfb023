/// JWT Authentication Middleware
///
/// Verifies the bearer access token on every request in a protected scope
/// and injects the verified `Claims` into request extensions. No storage is
/// touched: access tokens are self-contained.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::TokenFactory;
use crate::error::{AppError, AuthError};

pub struct JwtMiddleware {
    tokens: TokenFactory,
}

impl JwtMiddleware {
    pub fn new(tokens: TokenFactory) -> Self {
        Self { tokens }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(JwtMiddlewareService {
            service: Rc::new(service),
            tokens: self.tokens.clone(),
        }))
    }
}

pub struct JwtMiddlewareService<S> {
    service: Rc<S>,
    tokens: TokenFactory,
}

/// The token from an `Authorization: Bearer <token>` header
fn bearer_token(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = match bearer_token(&req) {
            Some(token) => token,
            None => {
                tracing::warn!(path = %req.path(), "Missing or invalid Authorization header");
                let err = AppError::from(AuthError::MissingToken);
                return Box::pin(async move { Err(Error::from(err)) });
            }
        };

        match self.tokens.parse_access_token(&token) {
            Ok(access_token) => {
                let claims = *access_token.claims();
                req.extensions_mut().insert(claims);

                tracing::debug!(
                    subject_id = %claims.subject(),
                    role = %claims.role(),
                    "Access token verified"
                );

                let service = self.service.clone();
                Box::pin(async move { service.call(req).await })
            }
            Err(err) => {
                tracing::warn!(path = %req.path(), "Access token rejected");
                Box::pin(async move { Err(Error::from(err)) })
            }
        }
    }
}
