// src/error.rs
use std::io;
use thiserror::Error;

use crate::export::ExportError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Custom Error type for the meterline library
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Collection error: {0}")]
    Collection(String),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("{0} is already shut down")]
    AlreadyShutdown(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl MetricsError {
    pub(crate) fn poisoned() -> Self {
        MetricsError::Other("Lock poisoned".to_string())
    }
}
