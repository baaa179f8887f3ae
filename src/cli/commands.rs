//! CLI command definitions

use crate::core::{Revision, Stage};
use crate::execution::{Conclusion, UpstreamEvent};
use clap::Args;
use uuid::Uuid;

/// Build a pushed revision
#[derive(Debug, Args, Clone)]
pub struct PushCommand {
    /// Revision that was pushed
    pub revision: Revision,

    /// Keep running downstream stages while they succeed
    #[arg(long)]
    pub follow: bool,
}

/// Handle an upstream completion event
#[derive(Debug, Args, Clone)]
pub struct TriggerCommand {
    /// Stage that completed
    pub upstream_stage: Stage,

    /// How it ended
    #[arg(value_enum)]
    pub conclusion: ConclusionArg,

    /// Revision the upstream stage ran for
    pub revision: Revision,

    /// Keep running downstream stages while they succeed
    #[arg(long)]
    pub follow: bool,
}

impl TriggerCommand {
    pub fn event(&self) -> UpstreamEvent {
        UpstreamEvent {
            upstream_stage: self.upstream_stage,
            conclusion: self.conclusion.into(),
            revision: self.revision.clone(),
        }
    }
}

/// Manually run one stage
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Stage to run
    pub stage: Stage,

    /// Revision to run for; defaults to what the stage's source environment holds
    #[arg(short, long)]
    pub revision: Option<Revision>,

    /// Chain downstream stages after a successful run
    #[arg(long)]
    pub follow: bool,
}

/// Show environment aliases and stage statuses
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Show stage statuses for this revision
    #[arg(short, long)]
    pub revision: Option<Revision>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the audit trail
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Only attempts for this revision
    #[arg(short, long)]
    pub revision: Option<Revision>,

    /// Number of recent attempts to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Cancel a running attempt
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Attempt ID, as shown by `history` or `status`
    pub attempt_id: Uuid,
}

/// Validate the controller configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Upstream conclusion argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConclusionArg {
    Success,
    Failure,
    Cancelled,
}

impl From<ConclusionArg> for Conclusion {
    fn from(arg: ConclusionArg) -> Self {
        match arg {
            ConclusionArg::Success => Conclusion::Success,
            ConclusionArg::Failure => Conclusion::Failure,
            ConclusionArg::Cancelled => Conclusion::Cancelled,
        }
    }
}
