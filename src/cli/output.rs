//! CLI output formatting

use crate::core::{PipelineRun, ResourceKind, StageAttempt, StageStatus};
use crate::execution::ControllerEvent;
use crate::gate::QualityGateResult;
use crate::promotion::{AliasHolder, PromotionResult};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Spinner shown while a stage step runs
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}");
    if let Ok(template) = template {
        spinner.set_style(template);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Width available for one line of output
pub fn terminal_width() -> usize {
    term_size::dimensions_stdout().map(|(w, _)| w).unwrap_or(80)
}

/// Cut a line to `width` characters
pub fn truncate_line(line: &str, width: usize) -> String {
    if line.chars().count() <= width {
        return line.to_string();
    }
    let kept: String = line.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Format a stage status for display
pub fn format_status(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => style("PENDING").dim().to_string(),
        StageStatus::Running => style("RUNNING").yellow().to_string(),
        StageStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StageStatus::Failed => style("FAILED").red().to_string(),
        StageStatus::Cancelled => style("CANCELLED").yellow().to_string(),
        StageStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

fn status_icon(status: StageStatus) -> Emoji<'static, 'static> {
    match status {
        StageStatus::Succeeded => CHECK,
        StageStatus::Failed => CROSS,
        StageStatus::Running => SPINNER,
        StageStatus::Cancelled => WARN,
        StageStatus::Skipped => SKIP,
        StageStatus::Pending => INFO,
    }
}

/// One audit trail line
pub fn format_attempt(attempt: &StageAttempt) -> String {
    let id = attempt.id.to_string();
    let mut line = format!(
        "{}{} {} {} #{} {} ({}) {}",
        status_icon(attempt.status),
        style(&id[..8]).dim(),
        style(attempt.started_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        style(&attempt.revision).bold(),
        attempt.attempt,
        style(attempt.stage).cyan(),
        attempt.trigger,
        format_status(attempt.status)
    );
    if let Some(detail) = &attempt.detail {
        line.push_str(&format!(" - {}", detail));
    }
    line
}

/// Stage statuses of one run, in pipeline order
pub fn format_run(run: &PipelineRun) -> String {
    let stages: Vec<String> = run
        .stage_statuses()
        .into_iter()
        .map(|(stage, status)| format!("{} {}", stage, format_status(status)))
        .collect();
    format!("{} {}", style(&run.revision).bold(), stages.join("  "))
}

/// Alias holders of one environment
pub fn format_environment(
    alias: &str,
    view: &BTreeMap<ResourceKind, Option<AliasHolder>>,
) -> Vec<String> {
    view.iter()
        .map(|(kind, holder)| match holder {
            Some(holder) => format!(
                "  {:<10} {:<18} {} {}",
                style(alias).cyan(),
                kind.to_string(),
                style(&holder.version).bold(),
                style(format!("(revision {})", holder.revision)).dim()
            ),
            None => format!(
                "  {:<10} {:<18} {}",
                style(alias).cyan(),
                kind.to_string(),
                style("unset").dim()
            ),
        })
        .collect()
}

fn format_gate(result: &QualityGateResult) -> String {
    if result.passed {
        format!(
            "{}quality gate passed for model version {}",
            CHECK,
            style(result.model_version).bold()
        )
    } else {
        format!(
            "{}quality gate rejected model version {}: {}",
            CROSS,
            style(result.model_version).bold(),
            style(result.summary()).red()
        )
    }
}

fn format_promotion(result: &PromotionResult) -> String {
    let moves: Vec<String> = result
        .moves
        .iter()
        .map(|m| match &m.previous {
            Some(previous) => format!("{} {} -> {}", m.kind, previous, m.version),
            None => format!("{} {}", m.kind, m.version),
        })
        .collect();
    format!(
        "{}'{}' now holds {} ({})",
        ROCKET,
        style(&result.alias).bold(),
        style(&result.revision).cyan(),
        moves.join(", ")
    )
}

/// Format a controller event for display
pub fn format_controller_event(event: &ControllerEvent) -> String {
    match event {
        ControllerEvent::StageStarted {
            stage,
            revision,
            attempt,
            trigger,
        } => {
            if *attempt > 1 {
                format!(
                    "{}Starting {} for {} (attempt {}, {})",
                    ROCKET,
                    style(stage).bold(),
                    style(revision).cyan(),
                    attempt,
                    style(trigger).dim()
                )
            } else {
                format!(
                    "{}Starting {} for {} ({})",
                    ROCKET,
                    style(stage).bold(),
                    style(revision).cyan(),
                    style(trigger).dim()
                )
            }
        }
        ControllerEvent::StageSkipped {
            stage,
            revision,
            reason,
        } => format!(
            "{}{} skipped for {}: {}",
            SKIP,
            style(stage).dim(),
            revision,
            style(reason).dim()
        ),
        ControllerEvent::StepStarted { stage, step } => {
            format!("{}{} {}", SPINNER, style(stage).dim(), style(step).cyan())
        }
        ControllerEvent::GateEvaluated { result, .. } => format_gate(result),
        ControllerEvent::ValidationFinished {
            target,
            passed,
            failures,
            ..
        } => {
            if *passed {
                format!("{}validation passed against {}", CHECK, style(target).bold())
            } else {
                let width = terminal_width().saturating_sub(6);
                let mut lines = vec![format!(
                    "{}validation failed against {} ({} failure(s))",
                    CROSS,
                    style(target).bold(),
                    failures.len()
                )];
                lines.extend(
                    failures
                        .iter()
                        .map(|f| format!("    {}", style(truncate_line(f, width)).dim())),
                );
                lines.join("\n")
            }
        }
        ControllerEvent::Promoted { result, .. } => format_promotion(result),
        ControllerEvent::StageSucceeded {
            stage,
            revision,
            next_stage,
        } => match next_stage {
            Some(next) => format!(
                "{}{} succeeded for {} → {}",
                CHECK,
                style(stage).green(),
                revision,
                style(next).cyan()
            ),
            None => format!("{}{} succeeded for {}", CHECK, style(stage).green(), revision),
        },
        ControllerEvent::StageFailed {
            stage,
            revision,
            error,
            requires_operator,
        } => {
            if *requires_operator {
                format!(
                    "{}{} for {} needs manual remediation: {}",
                    WARN,
                    style(stage).red().bold(),
                    revision,
                    style(error).red()
                )
            } else {
                format!(
                    "{}{} failed for {}: {}",
                    CROSS,
                    style(stage).red(),
                    revision,
                    style(error).dim()
                )
            }
        }
        ControllerEvent::StageCancelled { stage, revision } => {
            format!("{}{} cancelled for {}", WARN, style(stage).yellow(), revision)
        }
    }
}

/// Format a duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
