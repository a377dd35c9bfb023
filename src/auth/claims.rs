/// Identity Claims
///
/// The identity/authorization payload carried by an access token:
/// who the subject is and which role it acts under.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AuthError};

/// Opaque user identifier. The nil UUID is never a valid subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(Uuid);

impl SubjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse a subject from the `sub` claim of a token
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let id = Uuid::parse_str(raw).map_err(|_| AppError::Auth(AuthError::InvalidToken))?;
        Self::try_from(id)
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Uuid> for SubjectId {
    type Error = AppError;

    fn try_from(id: Uuid) -> Result<Self, Self::Error> {
        if id.is_nil() {
            return Err(AppError::Auth(AuthError::InvalidToken));
        }
        Ok(Self(id))
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roles known to the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Author,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Author => "author",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(Role::Author),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::Internal(format!("unknown role '{}'", other))),
        }
    }
}

/// Claims minted into every access token. Built fresh per issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claims {
    subject: SubjectId,
    role: Role,
}

impl Claims {
    pub fn new(subject: SubjectId, role: Role) -> Self {
        Self { subject, role }
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    pub fn role(&self) -> Role {
        self.role
    }
}
