//! Revisions, resource kinds and environments

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn revision_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9A-Za-z][0-9A-Za-z._-]{0,127}$").expect("revision pattern is valid")
    })
}

/// Identifier for a unit of source change (usually a commit id)
///
/// Revisions are the join key between artifacts, model versions and
/// pipeline runs. They are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Create a revision, validating its format
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidRevision> {
        let id = id.into();
        if revision_pattern().is_match(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidRevision(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Revision {
    type Err = InvalidRevision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Revision {
    type Error = InvalidRevision;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Revision> for String {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}

/// A revision string that does not look like a source revision
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid revision '{0}': expected 1-128 characters of [0-9A-Za-z._-]")]
pub struct InvalidRevision(pub String);

/// Kind of built artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Image that runs model training
    Training,
    /// Image that serves predictions
    Serving,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Training, ArtifactKind::Serving];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Training => "training",
            ArtifactKind::Serving => "serving",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(ArtifactKind::Training),
            "serving" => Ok(ArtifactKind::Serving),
            other => Err(format!("unknown artifact kind '{}'", other)),
        }
    }
}

/// A kind of independently versioned resource that can carry aliases
///
/// The derived ordering puts `Model` first. Promotion iterates kinds in
/// this order, so the model alias always moves before any image alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Model,
    Artifact(ArtifactKind),
}

impl ResourceKind {
    /// The resources that move together when a release is promoted
    pub fn release_set() -> std::collections::BTreeSet<ResourceKind> {
        [ResourceKind::Model, ResourceKind::Artifact(ArtifactKind::Serving)]
            .into_iter()
            .collect()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Model => f.write_str("model"),
            ResourceKind::Artifact(kind) => write!(f, "artifact:{}", kind),
        }
    }
}

/// Deployment environment, in promotion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Freshly built, addressed by revision rather than alias
    Commit,
    Staging,
    Production,
}

impl Environment {
    pub const ORDER: [Environment; 3] = [
        Environment::Commit,
        Environment::Staging,
        Environment::Production,
    ];

    /// The environment one step further along, if any
    pub fn next(&self) -> Option<Environment> {
        match self {
            Environment::Commit => Some(Environment::Staging),
            Environment::Staging => Some(Environment::Production),
            Environment::Production => None,
        }
    }

    /// Alias name held in the registries for this environment
    pub fn alias(&self) -> Option<&'static str> {
        match self {
            Environment::Commit => None,
            Environment::Staging => Some("staging"),
            Environment::Production => Some("production"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Commit => "commit",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Environment::Commit),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_validation() {
        assert!(Revision::new("abc123").is_ok());
        assert!(Revision::new("v1.2.3-rc_1").is_ok());
        assert!(Revision::new("").is_err());
        assert!(Revision::new("-leading-dash").is_err());
        assert!(Revision::new("has space").is_err());
        assert!(Revision::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_revision_serde_rejects_invalid() {
        let ok: Revision = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(ok.as_str(), "abc123");
        assert!(serde_json::from_str::<Revision>("\"bad rev\"").is_err());
    }

    #[test]
    fn test_model_orders_before_artifacts() {
        let kinds: Vec<_> = ResourceKind::release_set().into_iter().collect();
        assert_eq!(kinds[0], ResourceKind::Model);
        assert_eq!(kinds[1], ResourceKind::Artifact(ArtifactKind::Serving));
    }

    #[test]
    fn test_environment_moves_forward_one_step() {
        assert_eq!(Environment::Commit.next(), Some(Environment::Staging));
        assert_eq!(Environment::Staging.next(), Some(Environment::Production));
        assert_eq!(Environment::Production.next(), None);
        assert_eq!(Environment::Commit.alias(), None);
        assert_eq!(Environment::Production.alias(), Some("production"));
    }
}
