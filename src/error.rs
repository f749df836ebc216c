use std::time::Duration;

use thiserror::Error;

/// Represents errors that can occur in the UDBC module.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("General error: {0}")]
    General(String),
    #[error("Unknown driver scheme: {0}")]
    UnknownScheme(String),
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Checkout timed out after {0:?}")]
    PoolTimeout(Duration),
    #[error("Pool is closed")]
    PoolClosed,
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Driver {driver} does not accept parameter type {ty}")]
    UnsupportedParamType { driver: String, ty: String },
    #[error("Driver {driver} cannot read column as {ty}")]
    UnsupportedReadType { driver: String, ty: &'static str },
    #[error("Cannot read {found} value as {requested}")]
    TypeMismatch {
        requested: &'static str,
        found: &'static str,
    },
    #[error("{scheme} driver error: {message}")]
    Driver {
        scheme: String,
        message: String,
        retryable: bool,
    },
}

impl DbError {
    /// 连接级故障，可通过重建连接并重放操作恢复
    /// Faults recoverable by re-establishing a connection and re-issuing the
    /// operation. Only these are replayed by the pool's retry wrapper.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::ConnectionLost(_) => true,
            DbError::Driver { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
