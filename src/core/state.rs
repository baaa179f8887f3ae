//! Execution state models

use crate::core::{Revision, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of one stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    /// Stage has not started
    Pending,
    /// Stage is currently running
    Running,
    /// Stage completed successfully
    Succeeded,
    /// Stage failed
    Failed,
    /// Stage was cancelled before promotion
    Cancelled,
    /// Stage was not executed (e.g. the candidate was superseded)
    Skipped,
}

impl StageStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Whether this status stops downstream stages from starting
    pub fn halts_run(&self) -> bool {
        matches!(self, StageStatus::Failed | StageStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "Pending",
            StageStatus::Running => "Running",
            StageStatus::Succeeded => "Succeeded",
            StageStatus::Failed => "Failed",
            StageStatus::Cancelled => "Cancelled",
            StageStatus::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(StageStatus::Pending),
            "Running" => Ok(StageStatus::Running),
            "Succeeded" => Ok(StageStatus::Succeeded),
            "Failed" => Ok(StageStatus::Failed),
            "Cancelled" => Ok(StageStatus::Cancelled),
            "Skipped" => Ok(StageStatus::Skipped),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// What caused a stage to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    /// A source push (first stage only)
    Push,
    /// An operator invoked the stage directly
    ManualDispatch,
    /// The predecessor stage completed successfully
    UpstreamCompletion,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Push => "Push",
            TriggerSource::ManualDispatch => "ManualDispatch",
            TriggerSource::UpstreamCompletion => "UpstreamCompletion",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Push" => Ok(TriggerSource::Push),
            "ManualDispatch" => Ok(TriggerSource::ManualDispatch),
            "UpstreamCompletion" => Ok(TriggerSource::UpstreamCompletion),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}

/// One recorded attempt at running a stage for a revision
///
/// Attempts are the audit trail: together they answer which revision
/// reached which environment and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// Unique attempt ID
    pub id: Uuid,

    pub revision: Revision,

    pub stage: Stage,

    /// 1-based attempt number for this (stage, revision)
    pub attempt: u32,

    pub trigger: TriggerSource,

    pub status: StageStatus,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Failure or skip reason
    pub detail: Option<String>,

    /// Versions the stage acted on, keyed by resource kind
    #[serde(default)]
    pub versions: BTreeMap<String, String>,

    /// An operator asked the owning controller to stop before promotion
    #[serde(default)]
    pub cancel_requested: bool,

    /// Last sign of life from the owning controller
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl StageAttempt {
    /// Start a new running attempt
    pub fn start(stage: Stage, revision: Revision, attempt: u32, trigger: TriggerSource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            revision,
            stage,
            attempt,
            trigger,
            status: StageStatus::Running,
            started_at: now,
            finished_at: None,
            detail: None,
            versions: BTreeMap::new(),
            cancel_requested: false,
            heartbeat_at: Some(now),
        }
    }

    /// Whether the owner has been silent since `cutoff`
    pub fn owner_silent_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.heartbeat_at.map_or(true, |at| at < cutoff)
    }

    /// Mark the attempt finished with a terminal status
    pub fn finish(&mut self, status: StageStatus, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
        self.finished_at = Some(Utc::now());
    }
}

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// A later revision took over the environment before this run finished
    Superseded,
}

/// One execution of the stage chain for a revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub revision: Revision,

    /// What started the run's first stage
    pub triggered_by: TriggerSource,

    /// Every attempt of every stage, oldest first
    pub attempts: Vec<StageAttempt>,
}

impl PipelineRun {
    pub fn new(revision: Revision, triggered_by: TriggerSource) -> Self {
        Self {
            revision,
            triggered_by,
            attempts: Vec::new(),
        }
    }

    /// Rebuild a run from recorded attempts
    pub fn from_attempts(revision: Revision, mut attempts: Vec<StageAttempt>) -> Self {
        attempts.sort_by_key(|a| a.started_at);
        let triggered_by = attempts
            .first()
            .map(|a| a.trigger)
            .unwrap_or(TriggerSource::Push);
        Self {
            revision,
            triggered_by,
            attempts,
        }
    }

    /// Latest attempt for a stage
    pub fn latest_attempt(&self, stage: Stage) -> Option<&StageAttempt> {
        self.attempts.iter().rev().find(|a| a.stage == stage)
    }

    /// Status of a stage: its latest attempt's status, or Pending
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.latest_attempt(stage)
            .map(|a| a.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// Stage statuses in pipeline order
    pub fn stage_statuses(&self) -> Vec<(Stage, StageStatus)> {
        Stage::ORDER
            .iter()
            .map(|stage| (*stage, self.stage_status(*stage)))
            .collect()
    }

    /// Number of attempts recorded for a stage
    pub fn attempt_count(&self, stage: Stage) -> u32 {
        self.attempts.iter().filter(|a| a.stage == stage).count() as u32
    }

    /// First upstream stage whose status halts progression into `stage`
    pub fn blocking_stage(&self, stage: Stage) -> Option<Stage> {
        stage
            .upstream()
            .iter()
            .find(|upstream| self.stage_status(**upstream).halts_run())
            .copied()
    }

    pub fn status(&self) -> RunStatus {
        let statuses = self.stage_statuses();
        if statuses.iter().any(|(_, s)| *s == StageStatus::Failed) {
            RunStatus::Failed
        } else if statuses.iter().any(|(_, s)| *s == StageStatus::Cancelled) {
            RunStatus::Cancelled
        } else if statuses.iter().any(|(_, s)| *s == StageStatus::Skipped) {
            RunStatus::Superseded
        } else if statuses.iter().all(|(_, s)| *s == StageStatus::Succeeded) {
            RunStatus::Succeeded
        } else if statuses.iter().all(|(_, s)| *s == StageStatus::Pending) {
            RunStatus::Pending
        } else {
            RunStatus::Running
        }
    }

    /// A run is terminal once a stage failed or the last stage succeeded
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::Succeeded | RunStatus::Superseded
        )
    }
}
