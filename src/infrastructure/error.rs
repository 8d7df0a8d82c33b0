use crate::domain::error::SlotError;
use crate::domain::models::SlotKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Remote error: http {status}; {message}")]
    Remote { status: u16, message: String },
    #[error("Stale write for {key}: sequence {sequence} superseded by {latest}")]
    StaleWrite {
        key: String,
        sequence: u64,
        latest: u64,
    },
}

impl InfraError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::Slot(SlotError::InvalidInput(message.into()))
    }

    pub fn conflict(key: SlotKey) -> Self {
        Self::Slot(SlotError::Conflict(key))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Slot(SlotError::NotFound(message.into()))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Slot(SlotError::Conflict(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Slot(SlotError::NotFound(_)))
    }

    /// Transient failures the UI may offer to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkUnavailable(_) | Self::Io(_) => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short label for the command log and the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Sqlite(_) => "sqlite",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Slot(SlotError::Conflict(_)) => "conflict",
            Self::Slot(SlotError::NotFound(_)) => "not_found",
            Self::Slot(SlotError::InvalidInput(_)) => "invalid_input",
            Self::NetworkUnavailable(_) => "network_unavailable",
            Self::Remote { .. } => "remote",
            Self::StaleWrite { .. } => "stale_write",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Slot(SlotError::Conflict(key)) => {
                format!("The slot {key} is already blocked.")
            }
            Self::Slot(SlotError::NotFound(target)) => {
                format!("No blocked slot matches {target}; nothing was changed.")
            }
            Self::Slot(SlotError::InvalidInput(message)) => message.clone(),
            error if error.is_retryable() => {
                "The server could not be reached. Showing last known data; please retry.".to_string()
            }
            error => format!("Something went wrong: {error}"),
        }
    }
}

pub(crate) fn poisoned(what: &str, error: impl std::fmt::Display) -> InfraError {
    InfraError::InvalidConfig(format!("{what} lock poisoned: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn classification_separates_user_errors_from_transient_ones() {
        let key = SlotKey::new(
            NaiveDate::from_ymd_opt(2025, 5, 6).expect("valid date"),
            14,
        );
        let conflict = InfraError::conflict(key);
        let not_found = InfraError::not_found("2025-05-06@14");
        let offline = InfraError::NetworkUnavailable("timed out".to_string());
        let server = InfraError::Remote {
            status: 503,
            message: "maintenance".to_string(),
        };
        let rejected = InfraError::Remote {
            status: 400,
            message: "bad hour".to_string(),
        };

        assert!(conflict.is_conflict() && !conflict.is_retryable());
        assert!(not_found.is_not_found() && !not_found.is_retryable());
        assert!(offline.is_retryable());
        assert!(server.is_retryable());
        assert!(!rejected.is_retryable());

        assert_eq!(conflict.kind(), "conflict");
        assert!(conflict.user_message().contains("already blocked"));
        assert!(not_found.user_message().contains("nothing was changed"));
        assert_ne!(offline.user_message(), conflict.user_message());
    }
}
