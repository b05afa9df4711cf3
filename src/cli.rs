use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::{self, AppConfig};
use crate::daemon::{self, Services};
use crate::pidfile::{self, DaemonStatus};
use crate::reconciler::{BatchSummary, PushOutcome};

/// Keep a folder of Markdown tickets in sync with Linear
#[derive(Parser, Debug)]
#[command(name = "ticketsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.ticketsync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the sync daemon in the foreground
    Run,
    /// Ask a running daemon to shut down
    Stop,
    /// Show whether the daemon is running and where its tunnel points
    Status,
    /// Overwrite the local file of one ticket with the remote state
    Pull { id: String },
    /// Send local status, title and description changes of one ticket
    Push { id: String },
    /// Pull every ticket of the team
    PullAll,
    /// Push every file edited since its last sync
    PushAll,
    /// Create a ticket and pull it into the tree
    ///
    /// Examples:
    ///   ticketsync add "Fix the login bug"
    ///   ticketsync add Fix the login bug -d "Users can't log in with SSO"
    ///   ticketsync add "Write docs" --status "In Progress"
    Add {
        /// Title words; joined with spaces
        #[arg(required = true)]
        title: Vec<String>,

        /// Description
        #[arg(short = 'd', long = "desc", visible_alias = "description")]
        description: Option<String>,

        /// Initial status, one of the configured [[statuses]] names
        #[arg(long)]
        status: Option<String>,
    },
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run => daemon::run(config::load_config(config_path)?).await,
        Commands::Stop => stop(),
        Commands::Status => status(config::load_config(config_path).ok()).await,
        Commands::Pull { id } => {
            let services = services(config_path)?;
            let outcome = services.reconciler.pull(&id).await?;
            println!("Pulled {id} to {}", outcome.path.display());
            if let Some(from) = outcome.moved_from {
                println!("  moved from {}", from.display());
            }
            Ok(())
        }
        Commands::Push { id } => {
            let services = services(config_path)?;
            match services.reconciler.push(&id).await? {
                PushOutcome::Updated(fields) => println!("Pushed {id}: {}", fields.join(", ")),
                PushOutcome::Unchanged => println!("{id} is up to date"),
            }
            Ok(())
        }
        Commands::PullAll => {
            let summary = services(config_path)?.reconciler.pull_all().await?;
            print_summary(&summary, "pulled");
            Ok(())
        }
        Commands::PushAll => {
            let summary = services(config_path)?.reconciler.push_all().await?;
            print_summary(&summary, "pushed");
            Ok(())
        }
        Commands::Add {
            title,
            description,
            status,
        } => {
            let title = title.join(" ");
            if title.trim().is_empty() {
                bail!("Ticket title cannot be empty");
            }
            let services = services(config_path)?;
            let (id, outcome) = services
                .reconciler
                .create(&title, description.as_deref(), status.as_deref())
                .await?;
            println!("Created {id}: {title}");
            println!("  {}", outcome.path.display());
            Ok(())
        }
    }
}

fn services(config_path: Option<&std::path::Path>) -> Result<Services> {
    Services::from_config(&config::load_config(config_path)?)
}

fn print_summary(summary: &BatchSummary, verb: &str) {
    println!("{}", summary.render(verb));
    for (id, reason) in &summary.skipped {
        println!("  skipped {id}: {reason}");
    }
    for (id, reason) in &summary.failed {
        println!("  failed {id}: {reason}");
    }
}

fn stop() -> Result<()> {
    let path = config::pid_path();
    match pidfile::status(&path)? {
        DaemonStatus::Running(pid) => {
            pidfile::terminate(pid)?;
            println!("Sent SIGTERM to ticketsync (pid {pid})");
        }
        DaemonStatus::Stale(pid) => println!("ticketsync is not running (stale marker for pid {pid})"),
        DaemonStatus::NotRunning => println!("ticketsync is not running"),
    }
    Ok(())
}

async fn status(config: Option<AppConfig>) -> Result<()> {
    let pid = match pidfile::status(&config::pid_path())? {
        DaemonStatus::Running(pid) => pid,
        DaemonStatus::Stale(_) | DaemonStatus::NotRunning => {
            println!("ticketsync is not running");
            return Ok(());
        }
    };
    println!("ticketsync is running (pid {pid})");

    let Some(config) = config else {
        return Ok(());
    };
    match health(&config).await {
        Ok(tunnel) => println!("  tunnel: {}", tunnel.as_deref().unwrap_or("down")),
        Err(e) => println!("  health check failed: {e:#}"),
    }
    Ok(())
}

async fn health(config: &AppConfig) -> Result<Option<String>> {
    let url = format!("http://{}:{}/health", config.server.bind, config.server.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let body: Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await?;
    Ok(body.get("tunnel").and_then(Value::as_str).map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("ticketsync").chain(args.iter().copied()))
    }

    fn add_args(args: &[&str]) -> (String, Option<String>, Option<String>) {
        match parse(args).unwrap().command {
            Commands::Add {
                title,
                description,
                status,
            } => (title.join(" "), description, status),
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn parse_simple_title() {
        let (title, desc, status) = add_args(&["add", "Fix the login bug"]);
        assert_eq!(title, "Fix the login bug");
        assert_eq!(desc, None);
        assert_eq!(status, None);
    }

    #[test]
    fn parse_multi_word_title() {
        let (title, _, _) = add_args(&["add", "Fix", "the", "login", "bug"]);
        assert_eq!(title, "Fix the login bug");
    }

    #[test]
    fn parse_description_flags() {
        for flag in ["-d", "--desc", "--description"] {
            let (title, desc, _) = add_args(&["add", "Fix login", flag, "SSO is broken"]);
            assert_eq!(title, "Fix login");
            assert_eq!(desc.as_deref(), Some("SSO is broken"));
        }
    }

    #[test]
    fn parse_status_flag() {
        let (_, _, status) = add_args(&["add", "Write docs", "--status", "In Progress"]);
        assert_eq!(status.as_deref(), Some("In Progress"));
    }

    #[test]
    fn add_requires_a_title() {
        assert!(parse(&["add"]).is_err());
        assert!(parse(&["add", "-d", "only a description"]).is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = parse(&["pull", "ENG-42", "-v", "--config", "/tmp/c.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert_eq!(cli.command, Commands::Pull { id: "ENG-42".into() });
    }

    #[test]
    fn batch_commands_are_kebab_case() {
        assert_eq!(parse(&["pull-all"]).unwrap().command, Commands::PullAll);
        assert_eq!(parse(&["push-all"]).unwrap().command, Commands::PushAll);
        assert!(parse(&["sync"]).is_err());
    }
}
