use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::InternalError,
    http::header::{HeaderMap, HeaderName, HeaderValue},
    http::StatusCode,
    Error,
};
use futures::future::LocalBoxFuture;
use log::{info, warn};
use std::rc::Rc;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Id of the request being served, if called from inside `LoggerMiddleware`
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Request/response logging.
///
/// Tags every response with an `x-request-id` header. The same id is
/// visible to handlers through `current_request_id`, and error bodies
/// carry it as `error_id`. Never logs query strings, headers or bodies:
/// they may carry bearer secrets.
pub struct LoggerMiddleware;

impl<S, B> Transform<S, ServiceRequest> for LoggerMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = LoggerMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(LoggerMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct LoggerMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for LoggerMiddlewareService<S>
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
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let method = req.method().to_string();
        let path = req.path().to_string();

        info!("[{}] {} {} started", request_id, method, path);

        let service = self.service.clone();

        Box::pin(REQUEST_ID.scope(request_id.clone(), async move {
            match service.call(req).await {
                Ok(mut res) => {
                    tag(res.headers_mut(), &request_id);
                    log_completion(&request_id, &method, &path, res.status(), started);
                    Ok(res)
                }
                Err(err) => {
                    // Render while the request id is still in scope
                    let mut response = err.error_response();
                    tag(response.headers_mut(), &request_id);
                    log_completion(&request_id, &method, &path, response.status(), started);
                    Err(InternalError::from_response(err, response).into())
                }
            }
        }))
    }
}

fn tag(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

fn log_completion(request_id: &str, method: &str, path: &str, status: StatusCode, started: Instant) {
    let elapsed = started.elapsed().as_millis();

    if status.is_server_error() {
        warn!(
            "[{}] {} {} -> {} ({}ms)",
            request_id,
            method,
            path,
            status.as_u16(),
            elapsed
        );
    } else {
        info!(
            "[{}] {} {} -> {} ({}ms)",
            request_id,
            method,
            path,
            status.as_u16(),
            elapsed
        );
    }
}
