//! Error types for the fleet control plane.

use std::path::PathBuf;

use botfleet_daemon_protocol::ErrorInfo;

/// All errors that can occur in fleet operations.
///
/// `code()` maps each variant onto the IPC error code returned to clients.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    // ─────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Account already active: {0}")]
    AlreadyActive(String),

    // ─────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Persistence failure: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Process failure: {context}: {details}")]
    Process { context: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Daemon Setup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },
}

/// Convenience type alias for Results using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn persistence(context: impl Into<String>, source: rusqlite::Error) -> Self {
        FleetError::Persistence {
            context: context.into(),
            source,
        }
    }

    pub fn process(context: impl Into<String>, details: impl ToString) -> Self {
        FleetError::Process {
            context: context.into(),
            details: details.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "validation_error",
            FleetError::NotFound { .. } => "not_found",
            FleetError::AlreadyActive(_) => "already_active",
            FleetError::Persistence { .. } => "persistence_failure",
            FleetError::Process { .. } => "process_failure",
            FleetError::Io { .. } | FleetError::Config { .. } => "internal_error",
        }
    }
}

impl From<FleetError> for ErrorInfo {
    fn from(err: FleetError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_renders_kind_and_id() {
        let err = FleetError::not_found("account", 42);
        assert_eq!(err.to_string(), "account not found: 42");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn converts_into_protocol_error() {
        let info: ErrorInfo = FleetError::AlreadyActive("42".to_string()).into();
        assert_eq!(info.code, "already_active");
        assert_eq!(info.message, "Account already active: 42");
    }
}
