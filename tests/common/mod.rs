#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;

use auth_sessions::auth::{
    Clock, InMemoryTokenStore, ManualClock, PasswordHasher, Role, SessionRepository,
    SessionService, SubjectId, TokenFactory,
};
use auth_sessions::configuration::JwtSettings;
use auth_sessions::startup::run;
use auth_sessions::telemetry::try_init_telemetry;
use auth_sessions::users::{InMemoryUserDirectory, User};

pub const ACCESS_TOKEN_TTL: i64 = 900;
pub const REFRESH_TOKEN_TTL: i64 = 3600;

pub struct TestContext {
    pub service: SessionService,
    pub users: InMemoryUserDirectory,
    pub store: InMemoryTokenStore,
    pub clock: Arc<ManualClock>,
    pub hasher: PasswordHasher,
}

pub fn jwt_settings() -> JwtSettings {
    JwtSettings {
        secret: "integration-test-secret".to_string(),
        access_token_expiry: ACCESS_TOKEN_TTL,
        refresh_token_expiry: REFRESH_TOKEN_TTL,
        issuer: "auth_sessions_test".to_string(),
    }
}

/// Session service over in-memory stores with a manually driven clock
pub fn test_context() -> TestContext {
    try_init_telemetry("warn");

    let clock = Arc::new(ManualClock::starting_now());
    let users = InMemoryUserDirectory::new();
    let store = InMemoryTokenStore::with_users(users.clone());
    let hasher = PasswordHasher::new("integration-test-pepper", 4).expect("Invalid hasher config");
    let tokens = TokenFactory::new(&jwt_settings(), clock.clone() as Arc<dyn Clock>)
        .expect("Invalid token config");

    let service = SessionService::new(
        Arc::new(users.clone()),
        hasher.clone(),
        tokens,
        SessionRepository::new(Arc::new(store.clone())),
    );

    TestContext {
        service,
        users,
        store,
        clock,
        hasher,
    }
}

impl TestContext {
    pub async fn add_user(&self, email: &str, password: &str, role: Role) -> SubjectId {
        let id = SubjectId::new();
        self.users
            .insert(User {
                id,
                email: email.to_string(),
                password_hash: self.hasher.hash(password.as_bytes()).expect("Failed to hash"),
                role,
            })
            .await;
        id
    }
}

pub struct TestApp {
    pub address: String,
    pub context: TestContext,
}

pub async fn spawn_app() -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let context = test_context();
    let server = run(listener, context.service.clone()).expect("Failed to bind address");
    let _ = tokio::spawn(server);

    TestApp { address, context }
}
