/// Middleware module
///
/// Access-token verification for protected scopes.

mod jwt_middleware;

pub use jwt_middleware::JwtMiddleware;
