mod auth;
mod health_check;

pub use auth::{
    change_password, get_current_subject, login, logout, refresh, AuthResponse,
    ChangePasswordRequest, CurrentSubjectResponse, LoginRequest, RefreshRequest,
};
pub use health_check::health_check;
