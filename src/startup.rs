use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::net::TcpListener;
use std::sync::Arc;

use crate::auth::{
    PasswordHasher, PgTokenStore, SessionRepository, SessionService, SystemClock, TokenFactory,
};
use crate::configuration::{DatabaseSettings, Settings};
use crate::error::{AppError, DatabaseError};
use crate::logger::LoggerMiddleware;
use crate::middleware::JwtMiddleware;
use crate::routes::{change_password, get_current_subject, health_check, login, logout, refresh};
use crate::users::PgUserDirectory;

pub fn run(listener: TcpListener, service: SessionService) -> Result<Server, std::io::Error> {
    let tokens = service.tokens().clone();
    let service = web::Data::new(service);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(LoggerMiddleware)
            .app_data(service.clone())
            // Public routes
            .route("/health_check", web::get().to(health_check))
            .route("/auth/login", web::post().to(login))
            .route("/auth/refresh", web::post().to(refresh))
            .route("/auth/logout", web::post().to(logout))
            // Protected routes
            .service(
                web::scope("/api")
                    .wrap(JwtMiddleware::new(tokens.clone()))
                    .route("/me", web::get().to(get_current_subject))
                    .route("/password", web::post().to(change_password)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}

pub async fn get_connection_pool(settings: &DatabaseSettings) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.connection_string())
        .await
        .map_err(|e| AppError::persistence("pool.connect", DatabaseError::from(e)))
}

/// Wire the Postgres-backed service from settings. Secrets are validated here.
pub fn build_service(settings: &Settings, pool: PgPool) -> Result<SessionService, AppError> {
    let hasher = PasswordHasher::from_settings(&settings.password)?;
    let tokens = TokenFactory::new(&settings.jwt, Arc::new(SystemClock))?;

    Ok(SessionService::new(
        Arc::new(PgUserDirectory::new(pool.clone())),
        hasher,
        tokens,
        SessionRepository::new(Arc::new(PgTokenStore::new(pool))),
    ))
}
