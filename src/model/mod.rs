//! Document model, schema validation, and the persisted snapshot format
//!
//! The tree here owns structural invariants only: name uniqueness, typed
//! direction values, all-or-nothing mutations. Concurrency and merge
//! semantics live in `crate::convergent`.

pub mod document;
pub mod validate;
pub mod xml;

pub use document::{Application, Direction, Document, Topic, SCHEMA_VERSION, SCHEMA_XMLNS};
pub use validate::{validate, Severity, Violation};
pub use xml::{from_xml, to_xml, XmlError};

use thiserror::Error;

/// Structural document errors, returned synchronously to the mutation caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Application '{0}' already exists")]
    DuplicateApplication(String),

    #[error("Topic '{topic}' already exists in application '{app}'")]
    DuplicateTopic { app: String, topic: String },

    #[error("Application '{0}' not found")]
    ApplicationNotFound(String),

    #[error("Topic '{topic}' not found in application '{app}'")]
    TopicNotFound { app: String, topic: String },

    #[error("Invalid direction '{0}'. Must be 'publish' or 'subscribe'")]
    InvalidDirection(String),
}
