use auth_sessions::configuration::get_configuration;
use auth_sessions::startup::{build_service, get_connection_pool, run};
use auth_sessions::telemetry::init_telemetry;
use std::net::TcpListener;

fn startup_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    tracing::error!(error = %e, "{}", context);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();
    tracing::info!("Starting application");

    let configuration =
        get_configuration().map_err(|e| startup_error("Failed to read configuration", e))?;

    let pool = get_connection_pool(&configuration.database)
        .await
        .map_err(|e| startup_error("Failed to create connection pool", e))?;
    tracing::info!("Database connection pool created");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| startup_error("Failed to run migrations", e))?;

    let service = build_service(&configuration, pool)
        .map_err(|e| startup_error("Invalid configuration", e))?;

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!(address = %address, "Server listening");

    run(listener, service)?.await
}
