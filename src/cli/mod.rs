//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, HistoryCommand, PushCommand, RunCommand, StatusCommand, TriggerCommand,
    ValidateCommand,
};
use std::ffi::OsString;

/// Staged release controller for container images and trained models
#[derive(Debug, Parser, Clone)]
#[command(name = "stagegate")]
#[command(author = "stagegate contributors")]
#[command(version = "0.1.0")]
#[command(
    about = "Moves a revision's images and model through commit, staging and production",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to controller configuration file
    #[arg(short, long, global = true, default_value = "stagegate.yaml")]
    pub config: String,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Build a pushed revision
    Push(PushCommand),

    /// Handle an upstream completion event
    Trigger(TriggerCommand),

    /// Manually run one stage
    Run(RunCommand),

    /// Show environment aliases and stage statuses
    Status(StatusCommand),

    /// Show the audit trail
    History(HistoryCommand),

    /// Cancel a running attempt
    Cancel(CancelCommand),

    /// Validate the controller configuration
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
