//! Custom error types for the application.
//!
//! This module defines the primary error type, `ZptessError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while acquiring and calibrating.
//!
//! ## Error Hierarchy
//!
//! `ZptessError` consolidates the error taxonomy of the calibration system:
//!
//! - **`Config`** / **`Configuration`**: file parsing problems and semantic validation
//!   failures of the configuration.
//! - **`Endpoint`**: a device endpoint descriptor that cannot be understood.
//! - **`Link`** / **`LinkClosed`**: a transport that cannot bind, connect or open its
//!   device, or whose peer went away. Fatal to that role's pipeline only.
//! - **`Metadata`** / **`MetadataTimeout`**: the one-shot device info exchange failed;
//!   the role is marked offline.
//! - **`Store`**: errors surfaced by the persistence gateway.
//! - **`AlreadyFinalized`** / **`SessionIncomplete`**: misuse of the calibration state
//!   machine and sessions that ended before every summary was produced.
//!
//! Decode rejections and overflow drops are not errors: they are logged and the
//! pipeline continues. Consistency violations are reported as data by the verifier.

use crate::model::Role;
use crate::store::StoreError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ZptessError>;

#[derive(Error, Debug)]
pub enum ZptessError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid endpoint '{endpoint}': {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{role} link failure: {source}")]
    Link {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} link closed by peer")]
    LinkClosed(Role),

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("{role} metadata error: {reason}")]
    Metadata { role: Role, reason: String },

    #[error("{0} metadata fetch timed out")]
    MetadataTimeout(Role),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("{0} calibration already finalized")]
    AlreadyFinalized(Role),

    #[error("Calibration session incomplete: {0}")]
    SessionIncomplete(String),
}

impl From<figment::Error> for ZptessError {
    fn from(value: figment::Error) -> Self {
        ZptessError::Config(Box::new(value))
    }
}

impl ZptessError {
    /// True for errors that end a role's pipeline without touching the other role.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            ZptessError::Link { .. } | ZptessError::LinkClosed(_) | ZptessError::SerialFeatureDisabled
        )
    }
}
