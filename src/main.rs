use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use conductor::config::Config;
use conductor::core::{Priority, ProjectId, QueryId, Submission, WorkItemId};
use conductor::orchestration::{Coordinator, ProcessExecutor, ProjectReport, WorkerRegistry};
use conductor::state::FileStore;
use conductor::workflow::Resolution;
use conductor::{Error, Result};

/// Conductor - scheduling and coordination engine for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_*           Override config values (see ~/.conductor/conductor.toml)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Queue a work item for a project
    Submit {
        #[arg(long, short = 'p')]
        project: String,

        /// What the agent should do
        directive: String,

        /// What done looks like
        #[arg(long)]
        expect: String,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Item that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<WorkItemId>,

        #[arg(long)]
        task_type: Option<String>,
    },

    /// Drive a project until it is idle, blocked or complete
    Run {
        #[arg(long, short = 'p')]
        project: String,
    },

    /// Show a project's report without running anything
    Status {
        #[arg(long, short = 'p')]
        project: String,
    },

    /// Answer or dismiss a pending query, then resume the project
    Resolve {
        #[arg(long, short = 'p')]
        project: String,

        query_id: QueryId,

        /// Guidance passed to the blocked cycle
        decision: Option<String>,

        /// Dismiss the query instead of answering it
        #[arg(long)]
        dismiss: bool,
    },

    /// Cancel a work item and abort its cycle
    Cancel {
        #[arg(long, short = 'p')]
        project: String,

        item_id: WorkItemId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = conductor::log::init_with_debug(cli.debug)?;
    if conductor::log::is_debug() {
        tracing::info!("conductor starting (debug mode enabled)");
    } else {
        tracing::info!("conductor starting");
    }

    let config = Config::load()?;
    let result = dispatch(cli.command, &config).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "command failed");
    }
    result
}

async fn dispatch(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Submit {
            project,
            directive,
            expect,
            priority,
            depends_on,
            task_type,
        } => {
            let coordinator = build_coordinator(config, false)?;
            let mut submission = Submission::new(&directive, &expect).priority(priority);
            for dep in depends_on {
                submission = submission.depends_on(dep);
            }
            if let Some(task_type) = task_type {
                submission = submission.task_type(&task_type);
            }
            let id = coordinator.submit(&ProjectId::from(project.as_str()), submission).await?;
            print_json(&serde_json::json!({ "item_id": id.to_string() }))
        }
        Command::Run { project } => {
            let coordinator = build_coordinator(config, true)?;
            let cancel = CancellationToken::new();
            let sweeper = coordinator.spawn_sweeper(config.sweep_interval(), cancel.clone());
            let report = coordinator.drive_project(&ProjectId::from(project.as_str())).await;
            cancel.cancel();
            let _ = sweeper.await;
            print_report(&report?)
        }
        Command::Status { project } => {
            let coordinator = build_coordinator(config, false)?;
            print_report(&coordinator.report(&ProjectId::from(project.as_str())).await?)
        }
        Command::Resolve {
            project,
            query_id,
            decision,
            dismiss,
        } => {
            let resolution = match (decision, dismiss) {
                (_, true) => Resolution::Dismiss,
                (Some(decision), false) => Resolution::Answer(decision),
                (None, false) => {
                    return Err(Error::Config(
                        "resolve needs a DECISION or --dismiss".to_string(),
                    ))
                }
            };
            let coordinator = build_coordinator(config, true)?;
            let report = coordinator
                .resolve_query(&ProjectId::from(project.as_str()), query_id, resolution)
                .await?;
            print_report(&report)
        }
        Command::Cancel { project, item_id } => {
            let coordinator = build_coordinator(config, false)?;
            let status = coordinator
                .cancel(&ProjectId::from(project.as_str()), item_id)
                .await?;
            print_json(&serde_json::json!({
                "item_id": item_id.to_string(),
                "status": status.to_string(),
            }))
        }
    }
}

/// Commands that may execute work resolve the agent binary up front; the
/// rest never spawn it.
fn build_coordinator(config: &Config, executes: bool) -> Result<Coordinator> {
    let executor = if executes {
        ProcessExecutor::new(&config.execution.command)?
    } else {
        ProcessExecutor::with_binary(PathBuf::from(&config.execution.command))
    };
    let store = FileStore::new(Config::state_dir()?);
    let registry = WorkerRegistry::new(config.liveness_window());
    Ok(Coordinator::new(config.coordinator_config()?, Arc::new(executor), Arc::new(store))
        .with_registry(registry))
}

fn print_report(report: &ProjectReport) -> Result<()> {
    print_json(report)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_submit_command() {
        let dep = WorkItemId::new();
        let dep_str = dep.to_string();
        let cli = Cli::try_parse_from([
            "conductor",
            "submit",
            "-p",
            "api",
            "add login",
            "--expect",
            "login works",
            "--priority",
            "high",
            "--depends-on",
            dep_str.as_str(),
        ])
        .unwrap();
        assert!(!cli.debug);
        match cli.command {
            Command::Submit {
                project,
                directive,
                expect,
                priority,
                depends_on,
                task_type,
            } => {
                assert_eq!(project, "api");
                assert_eq!(directive, "add login");
                assert_eq!(expect, "login works");
                assert_eq!(priority, Priority::High);
                assert_eq!(depends_on, vec![dep]);
                assert!(task_type.is_none());
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_submit_defaults_to_normal_priority() {
        let cli = Cli::try_parse_from(["conductor", "submit", "-p", "api", "x", "--expect", "y"]).unwrap();
        match cli.command {
            Command::Submit { priority, .. } => assert_eq!(priority, Priority::Normal),
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_submit_requires_expected_outcome() {
        assert!(Cli::try_parse_from(["conductor", "submit", "-p", "api", "x"]).is_err());
    }

    #[test]
    fn test_bad_priority_rejected() {
        assert!(Cli::try_parse_from([
            "conductor", "submit", "-p", "api", "x", "--expect", "y", "--priority", "urgent"
        ])
        .is_err());
    }

    #[test]
    fn test_run_command_with_global_debug() {
        let cli = Cli::try_parse_from(["conductor", "run", "--project", "api", "--debug"]).unwrap();
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Command::Run {
                project: "api".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_command() {
        let query = QueryId::new();
        let query_str = query.to_string();
        let cli = Cli::try_parse_from(["conductor", "resolve", "-p", "api", query_str.as_str(), "Use JWT"]).unwrap();
        match cli.command {
            Command::Resolve {
                query_id,
                decision,
                dismiss,
                ..
            } => {
                assert_eq!(query_id, query);
                assert_eq!(decision.as_deref(), Some("Use JWT"));
                assert!(!dismiss);
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_cancel_rejects_malformed_id() {
        assert!(Cli::try_parse_from(["conductor", "cancel", "-p", "api", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["conductor"]).is_err());
    }
}
