/// Authentication Routes
///
/// Thin handlers over `SessionService`. Each one validates input shape,
/// calls one service operation and serialises the result.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{Claims, Session, SessionService};
use crate::error::AppError;
use crate::validators::{is_valid_email, is_valid_token};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Access and refresh token pair handed to the client
#[derive(Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Whole seconds left on the access token, rounded down
    pub expires_in: i64,
    pub expires_at: String,
}

impl AuthResponse {
    /// `expires_at` is truncated to the second at issue, so the lifetime
    /// left can be up to a second short of the configured one.
    fn from_session(session: &Session, now: DateTime<Utc>) -> Self {
        let expires_at = session.access_token.expires_at();
        Self {
            access_token: session.access_token.signed().to_string(),
            refresh_token: session.refresh_token.id().to_string(),
            token_type: "Bearer".to_string(),
            expires_in: (expires_at - now).num_seconds().max(0),
            expires_at: expires_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct CurrentSubjectResponse {
    pub subject_id: String,
    pub role: String,
}

/// POST /auth/login
///
/// # Errors
/// - 400: malformed email
/// - 401: unknown email or wrong password, indistinguishable
pub async fn login(
    form: web::Json<LoginRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    let email = is_valid_email(&form.email)?;

    let session = service.create(&email, &form.password).await?;

    let now = service.tokens().clock().now();
    Ok(HttpResponse::Ok().json(AuthResponse::from_session(&session, now)))
}

/// POST /auth/refresh
///
/// Rotates the refresh token: the presented one is consumed and a new pair
/// is returned.
///
/// # Errors
/// - 401: refresh token expired
/// - 404: refresh token unknown or already used
pub async fn refresh(
    form: web::Json<RefreshRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    is_valid_token("refresh_token", &form.refresh_token)?;

    let session = service.refresh(&form.refresh_token).await?;

    let now = service.tokens().clock().now();
    Ok(HttpResponse::Ok().json(AuthResponse::from_session(&session, now)))
}

/// POST /auth/logout
///
/// # Errors
/// - 404: refresh token unknown or already used
pub async fn logout(
    form: web::Json<RefreshRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    is_valid_token("refresh_token", &form.refresh_token)?;

    service.destroy(&form.refresh_token).await?;

    Ok(HttpResponse::NoContent().finish())
}

/// GET /api/me
///
/// Claims are injected by `JwtMiddleware`.
pub async fn get_current_subject(claims: web::ReqData<Claims>) -> HttpResponse {
    HttpResponse::Ok().json(CurrentSubjectResponse {
        subject_id: claims.subject().to_string(),
        role: claims.role().to_string(),
    })
}

/// POST /api/password
///
/// Ends every session of the subject on success, including the caller's.
///
/// # Errors
/// - 400: new password fails the policy
/// - 401: current password is wrong
pub async fn change_password(
    claims: web::ReqData<Claims>,
    form: web::Json<ChangePasswordRequest>,
    service: web::Data<SessionService>,
) -> Result<HttpResponse, AppError> {
    service
        .change_password(claims.subject(), &form.current_password, &form.new_password)
        .await?;

    Ok(HttpResponse::NoContent().finish())
}
