use anyhow::{Context, Result};
use indicatif::ProgressBar;
use stagegate::cli::commands::{
    CancelCommand, HistoryCommand, PushCommand, RunCommand, StatusCommand, TriggerCommand,
    ValidateCommand,
};
use stagegate::cli::output::*;
use stagegate::cli::{Cli, Command};
use stagegate::core::config::Secret;
use stagegate::core::{Environment, StageError};
use stagegate::execution::{CancelRequest, Collaborators, ControllerSettings, ShellCollaborators};
use stagegate::persistence::{open_pool, AuditLog, SqliteAuditStore};
use stagegate::registry::{sqlite, SqliteImageRegistry, SqliteModelRegistry};
use stagegate::{
    ArtifactKind, ControllerConfig, ControllerEvent, PipelineController, RegistrySet, StageOutcome,
};
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit status when a promotion left aliases inconsistent
const EXIT_OPERATOR: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    if let Command::Validate(cmd) = &cli.command {
        return validate_config(&cli.config, cmd);
    }

    let config = load_config(&cli.config)?;
    let audit = open_audit(&config).await?;

    match &cli.command {
        Command::Push(cmd) => push(cmd, &config, audit).await,
        Command::Trigger(cmd) => trigger(cmd, &config, audit).await,
        Command::Run(cmd) => run_stage(cmd, &config, audit).await,
        Command::Status(cmd) => show_status(cmd, &config, audit).await,
        Command::History(cmd) => show_history(cmd, audit).await,
        Command::Cancel(cmd) => cancel_attempt(cmd, &config, audit).await,
        Command::Validate(_) => Ok(ExitCode::SUCCESS),
    }
}

fn load_config(path: &str) -> Result<ControllerConfig> {
    let mut config = ControllerConfig::from_file(path).context("Failed to load controller config")?;
    config
        .apply_env_overrides()
        .context("Invalid STAGEGATE_* environment override")?;
    Ok(config)
}

async fn open_audit(config: &ControllerConfig) -> Result<Arc<SqliteAuditStore>> {
    let db_path = config.state_db_path()?;
    let db_path = db_path.to_string_lossy();
    let pool = open_pool(&db_path).await?;
    Ok(Arc::new(SqliteAuditStore::new(pool).await?))
}

/// Registries and collaborators over the state database
async fn build_controller(
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<PipelineController> {
    let pool = audit.pool().clone();
    sqlite::migrate(&pool)
        .await
        .context("Failed to create registry tables")?;

    let model_pool = match config.model_db_path() {
        Some(path) => {
            let model_pool = open_pool(&path.to_string_lossy()).await?;
            sqlite::migrate(&model_pool)
                .await
                .context("Failed to create model registry tables")?;
            model_pool
        }
        None => pool.clone(),
    };

    let repository = &config.registry.repository;
    let registries = RegistrySet::new(
        Arc::new(SqliteImageRegistry::new(
            pool.clone(),
            repository.clone(),
            ArtifactKind::Training,
        )),
        Arc::new(SqliteImageRegistry::new(
            pool,
            repository.clone(),
            ArtifactKind::Serving,
        )),
        Arc::new(SqliteModelRegistry::new(model_pool)),
        config.model_name.clone(),
    );

    let shell =
        ShellCollaborators::from_config(&config.commands, repository, &config.model_registry);
    let collaborators = Collaborators {
        builder: Arc::new(shell.builder),
        trainer: Arc::new(shell.trainer),
        launcher: Arc::new(shell.launcher),
        harness: Arc::new(shell.harness),
    };

    let audit: Arc<dyn AuditLog> = audit;
    Ok(PipelineController::new(
        ControllerSettings::from(config),
        registries,
        collaborators,
        audit,
    ))
}

/// Controller that renders its events through a spinner
async fn console_controller(
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<(PipelineController, ProgressBar)> {
    let mut controller = build_controller(config, audit).await?;
    let spinner = create_spinner();
    let progress = spinner.clone();
    controller.add_event_handler(move |event| {
        if let ControllerEvent::StepStarted { stage, step } = &event {
            progress.set_message(format!("{} {}", stage, step));
        }
        progress.println(format_controller_event(&event));
    });
    Ok((controller, spinner))
}

fn finish(
    spinner: &ProgressBar,
    result: std::result::Result<Vec<StageOutcome>, StageError>,
) -> ExitCode {
    spinner.finish_and_clear();
    match result {
        Ok(outcomes) => {
            if outcomes.is_empty() {
                println!("{}Nothing to run", INFO);
            } else {
                let last = &outcomes[outcomes.len() - 1];
                println!(
                    "\n{}{} stage(s) completed for {}, last: {}",
                    CHECK,
                    outcomes.len(),
                    style(last.revision()).bold(),
                    style(last.stage()).cyan()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.source.requires_operator() {
                error!("{}", e);
                println!("\n{}{}", WARN, style(&e).red().bold());
                ExitCode::from(EXIT_OPERATOR)
            } else {
                println!("\n{}{}", CROSS, style(&e).red());
                ExitCode::FAILURE
            }
        }
    }
}

async fn push(
    cmd: &PushCommand,
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<ExitCode> {
    let (controller, spinner) = console_controller(config, audit).await?;
    let result = if cmd.follow {
        controller.run_revision(cmd.revision.clone()).await
    } else {
        controller.on_push(cmd.revision.clone()).await.map(|outcome| vec![outcome])
    };
    Ok(finish(&spinner, result))
}

async fn trigger(
    cmd: &TriggerCommand,
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<ExitCode> {
    let (controller, spinner) = console_controller(config, audit).await?;
    let event = cmd.event();
    let result = if cmd.follow {
        controller.follow(event).await
    } else {
        controller.handle_event(&event).await.map(|outcome| outcome.into_iter().collect())
    };
    Ok(finish(&spinner, result))
}

async fn run_stage(
    cmd: &RunCommand,
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<ExitCode> {
    let (controller, spinner) = console_controller(config, audit).await?;
    let result = match controller.dispatch_manual(cmd.stage, cmd.revision.clone()).await {
        Ok(outcome) if cmd.follow && outcome.succeeded() => {
            let event = outcome.completion_event();
            let mut outcomes = vec![outcome];
            controller.follow(event).await.map(|rest| {
                outcomes.extend(rest);
                outcomes
            })
        }
        Ok(outcome) => Ok(vec![outcome]),
        Err(e) => Err(e),
    };
    Ok(finish(&spinner, result))
}

async fn show_status(
    cmd: &StatusCommand,
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<ExitCode> {
    let controller = build_controller(config, audit).await?;
    let promotion = controller.promotion();

    let mut environments = BTreeMap::new();
    for env in [Environment::Staging, Environment::Production] {
        environments.insert(env, promotion.environment_view(env).await?);
    }
    let runs = match &cmd.revision {
        Some(revision) => vec![controller.machine().run(revision).await?],
        None => controller.machine().recent_runs(5).await?,
    };
    let running = controller.machine().running().await?;

    if cmd.json {
        let aliases: BTreeMap<String, BTreeMap<String, _>> = environments
            .iter()
            .map(|(env, view)| {
                let holders = view
                    .iter()
                    .map(|(kind, holder)| (kind.to_string(), holder.clone()))
                    .collect();
                (env.to_string(), holders)
            })
            .collect();
        let data = serde_json::json!({
            "environments": aliases,
            "runs": runs,
            "running": running,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}Environments ({})", INFO, style(&config.name).bold());
    for (env, view) in &environments {
        let alias = env.alias().unwrap_or(env.as_str());
        for line in format_environment(alias, view) {
            println!("{}", line);
        }
    }

    println!("\n{}Runs", INFO);
    if runs.iter().all(|run| run.attempts.is_empty()) {
        println!("  {}", style("no recorded attempts").dim());
    }
    for run in runs.iter().filter(|run| !run.attempts.is_empty()) {
        println!("  {}", format_run(run));
    }

    if !running.is_empty() {
        println!("\n{}Running attempts", SPINNER);
        for attempt in &running {
            println!("  {}  {}", format_attempt(attempt), style(attempt.id).dim());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_history(cmd: &HistoryCommand, audit: Arc<SqliteAuditStore>) -> Result<ExitCode> {
    let mut attempts = match &cmd.revision {
        Some(revision) => {
            let mut attempts = audit.attempts_for_revision(revision).await?;
            attempts.reverse();
            attempts
        }
        None => audit.recent(cmd.limit).await?,
    };
    attempts.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "attempts": attempts });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(ExitCode::SUCCESS);
    }

    if attempts.is_empty() {
        println!("{}No attempts recorded", INFO);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}Audit trail (latest {}):", INFO, attempts.len());
    let width = terminal_width();
    for attempt in &attempts {
        let mut line = format_attempt(attempt);
        if let Some(finished) = attempt.finished_at {
            if let Ok(duration) = finished.signed_duration_since(attempt.started_at).to_std() {
                line.push_str(&format!(" [{}]", format_duration(duration)));
            }
        }
        println!("  {}", truncate_line(&line, width.saturating_sub(2).max(40)));
        if !attempt.versions.is_empty() {
            let versions: Vec<String> =
                attempt.versions.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("      {}", style(versions.join(" ")).dim());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cancel_attempt(
    cmd: &CancelCommand,
    config: &ControllerConfig,
    audit: Arc<SqliteAuditStore>,
) -> Result<ExitCode> {
    let controller = build_controller(config, audit).await?;
    match controller.cancel(cmd.attempt_id).await {
        Ok(CancelRequest::Requested) => {
            println!(
                "{}Cancellation requested for attempt {}; its controller stops it before promotion",
                CHECK,
                style(cmd.attempt_id).bold()
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(CancelRequest::Expired) => {
            println!(
                "{}Attempt {} had no live controller and is now cancelled",
                CHECK,
                style(cmd.attempt_id).bold()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}{}", CROSS, style(e).red());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn validate_config(path: &str, cmd: &ValidateCommand) -> Result<ExitCode> {
    println!("{}Validating {}...", INFO, path);

    match load_config(path) {
        Ok(config) => {
            println!("{}Configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Model: {}", style(&config.model_name).bold());
            let gate: Vec<String> = config
                .quality_gate
                .iter()
                .map(|(metric, minimum)| format!("{} >= {}", metric, minimum))
                .collect();
            println!("  Quality gate: {}", style(gate.join(", ")).cyan());
            println!("  Validation suite: {}", style(&config.validation.suite).cyan());

            if cmd.json {
                let mut shown = config.clone();
                if shown.model_registry.token.is_some() {
                    shown.model_registry.token = Some(Secret::new("***"));
                }
                let json = serde_json::to_string_pretty(&shown)?;
                println!("\n{}", json);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(ExitCode::FAILURE)
        }
    }
}
