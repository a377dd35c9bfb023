/// Authentication module
///
/// Password hashing, access and refresh token minting, the refresh-token
/// rotation protocol and the session service built on top of them.

pub mod claims;
pub mod clock;
pub mod jwt;
pub mod password;
pub mod refresh_token;
pub mod repository;
pub mod service;
pub mod store;

pub use claims::{Claims, Role, SubjectId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use jwt::{AccessToken, TokenFactory};
pub use password::{validate_password_strength, PasswordHasher};
pub use refresh_token::{RefreshToken, Session};
pub use repository::{SessionRepository, TokenStore, TokenTransaction};
pub use service::SessionService;
pub use store::{InMemoryTokenStore, PgTokenStore};
