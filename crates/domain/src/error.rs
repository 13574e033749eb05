/// Shared error type used across all Warren crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invoker: {0}")]
    Invoker(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("channel: {0}")]
    Channel(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the originator should be told to retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let e = Error::Validation("bad workspace name".into());
        assert_eq!(e.to_string(), "validation: bad workspace name");

        let e = Error::Capacity("8 sub-agents running".into());
        assert!(e.to_string().starts_with("capacity:"));
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Capacity("full".into()).is_retryable());
        assert!(Error::Timeout("30m".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Invoker("boom".into()).is_retryable());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
