// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the agent.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
///
/// The variants double as the failure-policy kinds the HA engine dispatches
/// on: a `DcsUnavailable` tick defers all writes, a `CasConflict` is not an
/// error at all (someone else got there first), and a `DbFatal` pauses the
/// node until an operator intervenes.
#[derive(Error, Debug, Clone)]
pub enum StewardError {
    #[error("DCS unavailable: {0}")]
    DcsUnavailable(String),

    #[error("compare-and-set conflict")]
    CasConflict,

    #[error("database error: {0}")]
    DbTransient(String),

    #[error("fatal database error: {0}")]
    DbFatal(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("another long-running action is already in progress: {0}")]
    Busy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartialEq for StewardError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StewardError::DcsUnavailable(a), StewardError::DcsUnavailable(b)) => a == b,
            (StewardError::DbTransient(a), StewardError::DbTransient(b)) => a == b,
            (StewardError::DbFatal(a), StewardError::DbFatal(b)) => a == b,
            (StewardError::PreconditionFailed(a), StewardError::PreconditionFailed(b)) => a == b,
            (StewardError::Busy(a), StewardError::Busy(b)) => a == b,
            (StewardError::Config(a), StewardError::Config(b)) => a == b,
            (StewardError::HttpClient(a), StewardError::HttpClient(b)) => a == b,
            (StewardError::Internal(a), StewardError::Internal(b)) => a == b,
            (StewardError::Io(a), StewardError::Io(b)) => a.to_string() == b.to_string(),
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for StewardError {
    fn from(e: std::io::Error) -> Self {
        StewardError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for StewardError {
    fn from(e: reqwest::Error) -> Self {
        StewardError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for StewardError {
    fn from(e: serde_json::Error) -> Self {
        StewardError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<url::ParseError> for StewardError {
    fn from(e: url::ParseError) -> Self {
        StewardError::Config(format!("invalid URL: {e}"))
    }
}
