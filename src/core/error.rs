use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Failure kinds surfaced by the record store and the update orchestrator.
///
/// The set is closed: every boundary matches on [`ErrorKind`] explicitly
/// instead of relying on downcasts.
#[derive(Error, Debug)]
pub enum StockError {
    #[error("data error in {context}: {details}")]
    Data { context: String, details: String },

    #[error("update lock is held by process {pid}")]
    Contention { pid: i32 },

    #[error("failed to {operation} '{target}': {details}")]
    Resource {
        operation: String,
        target: String,
        details: String,
    },

    #[error("command '{command}' failed: {details}")]
    ExternalTool { command: String, details: String },

    #[error("{what} not found")]
    NotFound { what: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Data,
    Contention,
    Resource,
    ExternalTool,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Data => "data",
            Self::Contention => "contention",
            Self::Resource => "resource",
            Self::ExternalTool => "external_tool",
            Self::NotFound => "not_found",
        };
        write!(f, "{label}")
    }
}

impl StockError {
    pub fn data(context: impl fmt::Display, details: impl Into<String>) -> Self {
        Self::Data {
            context: context.to_string(),
            details: details.into(),
        }
    }

    pub fn resource(
        operation: impl Into<String>,
        target: impl fmt::Display,
        details: impl fmt::Display,
    ) -> Self {
        Self::Resource {
            operation: operation.into(),
            target: target.to_string(),
            details: details.to_string(),
        }
    }

    /// Shorthand for an I/O failure against a filesystem path.
    pub fn io(operation: impl Into<String>, path: &Path, err: std::io::Error) -> Self {
        Self::resource(operation, path.display(), err)
    }

    pub fn external(command: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ExternalTool {
            command: command.into(),
            details: details.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Data { .. } => ErrorKind::Data,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::ExternalTool { .. } => ErrorKind::ExternalTool,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, StockError>;

impl From<tokio::task::JoinError> for StockError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::resource("join", "blocking task", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(StockError::data("x.json", "bad").kind(), ErrorKind::Data);
        assert_eq!(StockError::Contention { pid: 7 }.kind(), ErrorKind::Contention);
        assert_eq!(
            StockError::external("git pull", "exit 1").kind(),
            ErrorKind::ExternalTool
        );
        assert_eq!(StockError::not_found("record 3").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn resource_message_carries_context() {
        let err = StockError::io(
            "write",
            Path::new("data/inventory.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(
            err.to_string(),
            "failed to write 'data/inventory.json': denied"
        );
    }
}
