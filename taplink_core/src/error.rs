//! Error types for Taplink

use thiserror::Error;

/// Main error type for Taplink operations
#[derive(Error, Debug)]
pub enum TaplinkError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Pairing error: {0}")]
    Pairing(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, TaplinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaplinkError::Discovery("mDNS failed".to_string());
        assert_eq!(err.to_string(), "Discovery error: mDNS failed");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TaplinkError = io_err.into();
        assert!(matches!(err, TaplinkError::Io(_)));
    }

    #[test]
    fn test_result_type() {
        let ok_result: Result<i32> = Ok(42);
        assert!(ok_result.is_ok());

        let err_result: Result<i32> = Err(TaplinkError::Timeout("test".to_string()));
        assert!(err_result.is_err());
    }
}
