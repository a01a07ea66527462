use std::fmt::Display;

use thiserror::Error;

/// Result alias for broker operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Canonical broker error surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{field} must not be empty")]
    EmptyComponent { field: &'static str },
    #[error("{field} must not contain '/'")]
    InvalidComponent { field: &'static str },
    #[error("{entity} does not exist")]
    NotFound { entity: String },
    #[error("{entity} already exists")]
    AlreadyExists { entity: String },
    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("{0}")]
    Backend(String),
    #[error("broker is not running")]
    NotRunning,
}

impl Error {
    /// Backend failure. Vault returns multi-line error bodies; they are folded
    /// onto one line so every message stays log-friendly.
    pub fn backend(message: impl Display) -> Self {
        Error::Backend(single_line(&message.to_string()))
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Error::NotFound {
            entity: entity.into(),
        }
    }

    pub fn decode(path: impl Into<String>, reason: impl Display) -> Self {
        Error::Decode {
            path: path.into(),
            reason: single_line(&reason.to_string()),
        }
    }

    /// Prefix the message with what was being attempted. The error class is
    /// preserved so callers can still map not-found and friends.
    pub fn context(self, context: impl Display) -> Self {
        match self {
            Error::Backend(message) => Error::Backend(format!("{context}: {message}")),
            Error::Decode { path, reason } => Error::Decode {
                path,
                reason: format!("{context}: {reason}"),
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Stable short code, used by the HTTP layer and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::EmptyComponent { .. } | Error::InvalidComponent { .. } => "invalid",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "conflict",
            Error::Decode { .. } => "decode",
            Error::Backend(_) => "backend",
            Error::NotRunning => "unavailable",
        }
    }
}

pub(crate) fn single_line(message: &str) -> String {
    message.replace("\r\n", " ").replace('\n', " ")
}

pub(crate) fn ensure_component(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::EmptyComponent { field });
    }
    Ok(())
}

/// Identifiers become single path segments in policies, mounts and store keys.
pub(crate) fn ensure_identifier(value: &str, field: &'static str) -> Result<()> {
    ensure_component(value, field)?;
    if value.contains('/') {
        return Err(Error::InvalidComponent { field });
    }
    Ok(())
}
