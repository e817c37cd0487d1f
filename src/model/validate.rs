//! Schema validation for document snapshots
//!
//! `validate` is a pure function from a snapshot to a list of violations.
//! It accumulates every failure instead of stopping at the first and never
//! mutates the document.

use serde::{Deserialize, Serialize};

use super::document::{Document, SCHEMA_VERSION, SCHEMA_XMLNS};

/// Expected suffix for proto contract references. Violations of this
/// convention are warnings, not errors.
pub const PROTO_SUFFIX: &str = ".proto";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A single validation finding, carrying the path of the offending node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Path such as `Applications`, `Application[2]` or `Application[2].Topic[0]`.
    pub path: String,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Validate a document snapshot against the fixed schema.
pub fn validate(doc: &Document) -> Vec<Violation> {
    let mut violations = Vec::new();

    if doc.xmlns != SCHEMA_XMLNS {
        violations.push(Violation::error(
            "Applications",
            format!("Invalid namespace '{}'. Expected: {}", doc.xmlns, SCHEMA_XMLNS),
        ));
    }

    if doc.version != SCHEMA_VERSION {
        violations.push(Violation::error(
            "Applications",
            format!("Invalid version '{}'. Expected: {}", doc.version, SCHEMA_VERSION),
        ));
    }

    for (i, app) in doc.applications.iter().enumerate() {
        let app_path = format!("Application[{}]", i);

        if app.name.trim().is_empty() {
            violations.push(Violation::error(&app_path, "Empty 'name' attribute"));
        }

        for (j, topic) in app.topics.iter().enumerate() {
            let topic_path = format!("{}.Topic[{}]", app_path, j);

            if topic.name.trim().is_empty() {
                violations.push(Violation::error(&topic_path, "Empty 'name' attribute"));
            }
            if topic.proto.trim().is_empty() {
                violations.push(Violation::error(&topic_path, "Empty 'proto' attribute"));
            } else if !topic.proto.ends_with(PROTO_SUFFIX) {
                violations.push(Violation::warning(
                    &topic_path,
                    format!(
                        "Proto file '{}' should end with '{}'",
                        topic.proto, PROTO_SUFFIX
                    ),
                ));
            }
            // `direction` is typed and cannot be blank or out of range here;
            // parsing already rejected anything outside publish/subscribe.
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::{Direction, Topic};

    #[test]
    fn test_valid_document_has_no_violations() {
        let mut doc = Document::new();
        doc.add_application("VideoViewer", "viewer").unwrap();
        doc.add_topic(
            "VideoViewer",
            Topic::new("PTZ_CONTROL", "ptz_ctl.proto", Direction::Publish, "PTZ control"),
        )
        .unwrap();
        assert!(validate(&doc).is_empty());
    }

    #[test]
    fn test_namespace_and_version_mismatch() {
        let mut doc = Document::new();
        doc.xmlns = "http://somewhere-else/schema".to_string();
        doc.version = "2.0".to_string();
        let violations = validate(&doc);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.is_error()));
    }

    #[test]
    fn test_accumulates_all_failures() {
        let mut doc = Document::new();
        doc.applications.push(crate::model::Application::new("", ""));
        doc.applications[0]
            .topics
            .push(Topic::new("", "", Direction::Publish, ""));
        let violations = validate(&doc);
        // Empty app name, empty topic name, empty proto
        assert_eq!(violations.len(), 3);
        assert_eq!(violations[0].path, "Application[0]");
        assert_eq!(violations[1].path, "Application[0].Topic[0]");
    }

    #[test]
    fn test_proto_suffix_is_warning_only() {
        let mut doc = Document::new();
        doc.add_application("A", "").unwrap();
        doc.add_topic("A", Topic::new("T", "contract.txt", Direction::Subscribe, ""))
            .unwrap();
        let violations = validate(&doc);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Warning);
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let mut doc = Document::new();
        doc.add_application("A", "").unwrap();
        let before = doc.clone();
        let _ = validate(&doc);
        assert_eq!(doc, before);
    }
}
