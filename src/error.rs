use thiserror::Error;

use crate::action::ApplyError;
use crate::binding::TemplateError;
use crate::path::PathError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum BulkError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    Request(String),
    #[error("Path error: {0}")]
    Path(#[from] PathError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, BulkError>;

// Helper conversions
impl From<config::ConfigError> for BulkError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<serde_json::Error> for BulkError {
    fn from(e: serde_json::Error) -> Self { Self::Request(e.to_string()) }
}
