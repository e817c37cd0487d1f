//! The in-memory topic document tree
//!
//! A Document is an ordered list of Applications, each owning an ordered
//! list of Topics. The tree owns no concurrency logic; every mutation is
//! all-or-nothing and duplicate detection runs before insertion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ModelError;

/// Namespace URI carried on the document root. Fixed for the running schema.
pub const SCHEMA_XMLNS: &str = "http://zeromq-topic-manager/schema";

/// Schema version carried on the document root.
pub const SCHEMA_VERSION: &str = "1.0";

/// Message flow direction of a topic.
///
/// Any other value is rejected at construction time, not just at
/// validation time, so structurally broken data never enters the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Publish,
    Subscribe,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Publish => "publish",
            Direction::Subscribe => "subscribe",
        }
    }
}

impl FromStr for Direction {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(Direction::Publish),
            "subscribe" => Ok(Direction::Subscribe),
            other => Err(ModelError::InvalidDirection(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named message topic owned by exactly one Application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub proto: String,
    pub direction: Direction,
    #[serde(default)]
    pub description: String,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        proto: impl Into<String>,
        direction: Direction,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            proto: proto.into(),
            direction,
            description: description.into(),
        }
    }
}

/// A named application owning an ordered list of Topics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl Application {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            topics: Vec::new(),
        }
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// The full document tree plus schema metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub xmlns: String,
    pub version: String,
    pub applications: Vec<Application>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document carrying the running schema's constants.
    pub fn new() -> Self {
        Self {
            xmlns: SCHEMA_XMLNS.to_string(),
            version: SCHEMA_VERSION.to_string(),
            applications: Vec::new(),
        }
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }

    fn application_mut(&mut self, name: &str) -> Option<&mut Application> {
        self.applications.iter_mut().find(|a| a.name == name)
    }

    /// Add a new application. Names are case-sensitive exact matches and
    /// must be unique within the document.
    pub fn add_application(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), ModelError> {
        let name = name.into();
        if self.application(&name).is_some() {
            return Err(ModelError::DuplicateApplication(name));
        }
        self.applications.push(Application::new(name, description));
        Ok(())
    }

    /// Remove an application, discarding exactly its own topics.
    pub fn remove_application(&mut self, name: &str) -> Result<(), ModelError> {
        let before = self.applications.len();
        self.applications.retain(|a| a.name != name);
        if self.applications.len() == before {
            return Err(ModelError::ApplicationNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Add a topic to the named application. The topic name must be unique
    /// within that application.
    pub fn add_topic(&mut self, app_name: &str, topic: Topic) -> Result<(), ModelError> {
        let app = self
            .application_mut(app_name)
            .ok_or_else(|| ModelError::ApplicationNotFound(app_name.to_string()))?;
        if app.topic(&topic.name).is_some() {
            return Err(ModelError::DuplicateTopic {
                app: app_name.to_string(),
                topic: topic.name,
            });
        }
        app.topics.push(topic);
        Ok(())
    }

    /// Remove a topic from the named application.
    pub fn remove_topic(&mut self, app_name: &str, topic_name: &str) -> Result<(), ModelError> {
        let app = self
            .application_mut(app_name)
            .ok_or_else(|| ModelError::ApplicationNotFound(app_name.to_string()))?;
        let before = app.topics.len();
        app.topics.retain(|t| t.name != topic_name);
        if app.topics.len() == before {
            return Err(ModelError::TopicNotFound {
                app: app_name.to_string(),
                topic: topic_name.to_string(),
            });
        }
        Ok(())
    }

    /// Deep, immutable copy for safe concurrent reads.
    pub fn snapshot(&self) -> Document {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptz_topic() -> Topic {
        Topic::new("PTZ_CONTROL", "ptz_ctl.proto", Direction::Publish, "PTZ control")
    }

    #[test]
    fn test_add_application_rejects_duplicate() {
        let mut doc = Document::new();
        doc.add_application("VideoViewer", "viewer").unwrap();
        let err = doc.add_application("VideoViewer", "other").unwrap_err();
        assert!(matches!(err, ModelError::DuplicateApplication(_)));
        assert_eq!(doc.applications.len(), 1);
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let mut doc = Document::new();
        doc.add_application("VideoViewer", "").unwrap();
        assert!(doc.add_application("videoviewer", "").is_ok());
    }

    #[test]
    fn test_topic_unique_per_application_only() {
        let mut doc = Document::new();
        doc.add_application("A", "").unwrap();
        doc.add_application("B", "").unwrap();
        doc.add_topic("A", ptz_topic()).unwrap();
        // Same topic name in a different application is fine
        doc.add_topic("B", ptz_topic()).unwrap();
        let err = doc.add_topic("A", ptz_topic()).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateTopic { .. }));
    }

    #[test]
    fn test_remove_application_discards_only_its_topics() {
        let mut doc = Document::new();
        doc.add_application("A", "").unwrap();
        doc.add_application("B", "").unwrap();
        doc.add_topic("A", ptz_topic()).unwrap();
        doc.add_topic("B", ptz_topic()).unwrap();

        doc.remove_application("A").unwrap();
        assert!(doc.application("A").is_none());
        assert_eq!(doc.application("B").unwrap().topics.len(), 1);
    }

    #[test]
    fn test_remove_missing_returns_not_found() {
        let mut doc = Document::new();
        assert!(matches!(
            doc.remove_application("ghost"),
            Err(ModelError::ApplicationNotFound(_))
        ));
        doc.add_application("A", "").unwrap();
        assert!(matches!(
            doc.remove_topic("A", "ghost"),
            Err(ModelError::TopicNotFound { .. })
        ));
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("publish".parse::<Direction>().unwrap(), Direction::Publish);
        assert_eq!("subscribe".parse::<Direction>().unwrap(), Direction::Subscribe);
        assert!("Publish".parse::<Direction>().is_err());
        assert!("both".parse::<Direction>().is_err());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut doc = Document::new();
        doc.add_application("A", "").unwrap();
        let snap = doc.snapshot();
        doc.add_application("B", "").unwrap();
        assert_eq!(snap.applications.len(), 1);
        assert_eq!(doc.applications.len(), 2);
    }
}
