//! Top-level error type aggregating the per-layer errors.

use thiserror::Error;

use crate::model::xml::XmlError;
use crate::model::ModelError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}
