use thiserror::Error;

/// Errors shared by every Taskloom crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("agent error: {0}")]
    Agent(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Fatal errors are surfaced immediately and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownCapability(_) | Error::Config(_) | Error::Authentication(_)
        )
    }

    /// Short, stable name of the variant, used as part of error signatures.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Agent(_) => "agent",
            Error::Provider(_) => "provider",
            Error::Tool(_) => "tool",
            Error::UnknownCapability(_) => "unknown_capability",
            Error::Config(_) => "config",
            Error::Authentication(_) => "authentication",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(Error::UnknownCapability("nope".into()).is_fatal());
        assert!(Error::Config("bad".into()).is_fatal());
        assert!(Error::Authentication("401".into()).is_fatal());
        assert!(!Error::Provider("ECONNRESET".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::UnknownCapability("teleport".into());
        assert_eq!(err.to_string(), "unknown capability: teleport");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.kind(), "io");
    }
}
