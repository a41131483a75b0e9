//! Error types for the session orchestrator

use std::io;
use thiserror::Error;

/// Orchestrator error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Proxy core executable not found: {0}")]
    BinaryNotFound(String),

    #[error("Proxy core exited immediately (code {code:?}): {stderr}")]
    ProcessExitedImmediately { code: Option<i32>, stderr: String },

    #[error("Tunnel establishment failed: {0}")]
    TunnelEstablishmentFailed(String),

    #[error("Network rebind failed: {0}")]
    NetworkRebindFailure(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session busy: {0}")]
    Busy(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedDescriptor(msg.into())
    }

    pub fn binary_not_found<S: Into<String>>(msg: S) -> Self {
        Error::BinaryNotFound(msg.into())
    }

    pub fn tunnel<S: Into<String>>(msg: S) -> Self {
        Error::TunnelEstablishmentFailed(msg.into())
    }

    pub fn rebind<S: Into<String>>(msg: S) -> Self {
        Error::NetworkRebindFailure(msg.into())
    }

    pub fn busy<S: Into<String>>(msg: S) -> Self {
        Error::Busy(msg.into())
    }

    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Error::Cancelled(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::malformed("missing protocol");
        assert_eq!(e.to_string(), "Malformed descriptor: missing protocol");

        let e = Error::ProcessExitedImmediately {
            code: Some(23),
            stderr: "bind: address already in use".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "Proxy core exited immediately (code Some(23)): bind: address already in use"
        );
    }

    #[test]
    fn test_yaml_error_maps_to_config() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{not: a list").unwrap_err();
        let e: Error = yaml_err.into();
        assert!(matches!(e, Error::Config(_)));
    }
}
