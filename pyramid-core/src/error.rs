use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Protocol violation in {id}: {reason}")]
    ProtocolViolation { id: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn protocol_violation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from the network and may succeed on a later attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Fetch(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_display() {
        let err = Error::protocol_violation("abc", "content is not JSON");
        assert_eq!(
            err.to_string(),
            "Protocol violation in abc: content is not JSON"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(Error::Fetch("relay gone".into()).is_transient());
        assert!(!Error::Publish("signing failed".into()).is_transient());
        assert!(!Error::protocol_violation("x", "bad").is_transient());
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
