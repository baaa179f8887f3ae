//! The fixed, linear stage order

use crate::core::revision::Environment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named unit of pipeline work
///
/// Stages form a fixed linear chain: each has at most one predecessor and
/// at most one successor. Ordering follows the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Build and push images tagged with the revision
    Build,
    /// Train, gate, validate and promote to staging
    Delivery,
    /// Validate the staging alias and promote to production
    Staging,
    /// Pull the production alias and instantiate it
    Deployment,
}

impl Stage {
    pub const ORDER: [Stage; 4] =
        [Stage::Build, Stage::Delivery, Stage::Staging, Stage::Deployment];

    fn position(&self) -> usize {
        Self::ORDER
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    /// The single stage that must complete before this one
    pub fn predecessor(&self) -> Option<Stage> {
        self.position().checked_sub(1).map(|i| Self::ORDER[i])
    }

    /// The stage triggered by this one's successful completion
    pub fn successor(&self) -> Option<Stage> {
        Self::ORDER.get(self.position() + 1).copied()
    }

    /// Stages that run before this one, in order
    pub fn upstream(&self) -> &'static [Stage] {
        &Self::ORDER[..self.position()]
    }

    /// Environment whose alias this stage reads its candidate from
    pub fn source_environment(&self) -> Option<Environment> {
        match self {
            Stage::Build => None,
            Stage::Delivery => Some(Environment::Commit),
            Stage::Staging => Some(Environment::Staging),
            Stage::Deployment => Some(Environment::Production),
        }
    }

    /// Environment this stage promotes into, if it promotes at all
    pub fn promotes_to(&self) -> Option<Environment> {
        match self {
            Stage::Delivery => Some(Environment::Staging),
            Stage::Staging => Some(Environment::Production),
            Stage::Build | Stage::Deployment => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Delivery => "delivery",
            Stage::Staging => "staging",
            Stage::Deployment => "deployment",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}
