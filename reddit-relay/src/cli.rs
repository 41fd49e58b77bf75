//! # reddit-relay CLI
//!
//! Command parsing and orchestration for the `reddit-relay` binary. All business logic
//! lives in `reddit-relay-core`; this module wires configuration, the SQLite store and
//! the Reddit/Telegram adapters into it.
//!
//! `run` is the long-lived service. The other commands open the same database, do one
//! thing and exit, so they can be used next to a running relay: rule edits and retries
//! are picked up by the service's periodic sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use reddit_relay_core::config::RelayConfig;
use reddit_relay_core::media::MediaPipeline;
use reddit_relay_core::model::{NewRule, PostId, RuleId, SortMode, TimeFilter};
use reddit_relay_core::relay::{open_stores, Relay, RelayAdmin, RelayCollaborators};

use crate::load_config::{load_config, Secrets};
use crate::reddit::RedditClient;
use crate::telegram::TelegramClient;

/// Forward approved subreddit media to Telegram channels.
#[derive(Parser)]
#[clap(name = "reddit-relay", version, about = "Moderated Reddit-to-Telegram media relay")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay until interrupted with Ctrl-C
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Print post counts per state and per rule as JSON
    Status {
        #[clap(long)]
        config: PathBuf,
    },
    /// Delete all dedup and post history and reset every rule's last check
    ClearHistory {
        #[clap(long)]
        config: PathBuf,
        /// Confirm the deletion
        #[clap(long)]
        yes: bool,
    },
    /// Manage forwarding rules
    Rules {
        #[clap(long)]
        config: PathBuf,
        #[clap(subcommand)]
        action: RuleCommand,
    },
    /// Move a failed post back to Approved so it is processed again
    Retry {
        #[clap(long)]
        config: PathBuf,
        post_id: String,
    },
}

#[derive(Subcommand)]
pub enum RuleCommand {
    /// List all rules as JSON
    List,
    /// Create a rule
    Add {
        /// Subreddit name, with or without the r/ prefix
        subreddit: String,
        /// Destination channel: @name or numeric chat id
        #[clap(long)]
        channel: String,
        /// Telegram user id of the admin who approves posts
        #[clap(long)]
        owner: i64,
        /// hot, new, top or rising
        #[clap(long, default_value = "hot")]
        sort: String,
        /// Window for top listings: hour, day, week, month, year or all
        #[clap(long, default_value = "day")]
        time: String,
        #[clap(long, default_value_t = 1)]
        interval_hours: u64,
        #[clap(long, default_value_t = 5)]
        max_items: u32,
    },
    /// Stop polling a rule, keeping its history
    Disable { id: RuleId },
    /// Resume polling a rule
    Enable { id: RuleId },
}

/// Async entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    info!("trace_initialised");

    match cli.command {
        Commands::Run { config } => serve(&config).await,
        Commands::Status { config } => {
            let admin = open_admin(&config).await?;
            let status = admin.status().await.context("Failed to read relay status")?;
            print_json(&status)
        }
        Commands::ClearHistory { config, yes } => {
            if !yes {
                bail!("refusing to clear history without --yes");
            }
            let admin = open_admin(&config).await?;
            let report = admin.clear_history().await.context("Failed to clear history")?;
            info!(command = "clear-history", ?report, "History cleared");
            print_json(&report)
        }
        Commands::Rules { config, action } => {
            let admin = open_admin(&config).await?;
            manage_rules(&admin, action).await
        }
        Commands::Retry { config, post_id } => {
            let admin = open_admin(&config).await?;
            let post = admin
                .retry(&PostId::from(post_id.as_str()))
                .await
                .with_context(|| format!("Failed to retry post {post_id}"))?;
            info!(command = "retry", post_id = %post.id, "Post requeued");
            println!("{} is {}", post.id, post.state);
            Ok(())
        }
    }
}

async fn manage_rules(admin: &RelayAdmin, action: RuleCommand) -> Result<()> {
    match action {
        RuleCommand::List => print_json(&admin.rules()),
        RuleCommand::Add {
            subreddit,
            channel,
            owner,
            sort,
            time,
            interval_hours,
            max_items,
        } => {
            let rule = NewRule {
                subreddit,
                sort: sort.parse::<SortMode>()?,
                time_filter: time.parse::<TimeFilter>()?,
                poll_interval: Duration::from_secs(interval_hours.saturating_mul(3600)),
                max_items,
                channel,
                owner,
            };
            rule.check_admin_interval()?;
            let created = admin.add_rule(rule).await.context("Failed to add rule")?;
            print_json(&created)
        }
        RuleCommand::Disable { id } => {
            let rule = admin.set_rule_enabled(id, false).await.context("Failed to disable rule")?;
            print_json(&rule)
        }
        RuleCommand::Enable { id } => {
            let rule = admin.set_rule_enabled(id, true).await.context("Failed to enable rule")?;
            print_json(&rule)
        }
    }
}

async fn open_admin(path: &Path) -> Result<RelayAdmin> {
    let config = load_config(path)?;
    let stores = open_stores(&config)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    Ok(RelayAdmin::open(config, stores).await?)
}

async fn serve(path: &Path) -> Result<()> {
    let config: RelayConfig = load_config(path)?;
    let secrets = Secrets::from_env()?;
    config.trace_loaded();

    let pipeline = MediaPipeline::new(config.pipeline.clone()).context("Failed to set up the media pipeline")?;
    let stores = open_stores(&config)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let telegram = Arc::new(TelegramClient::new(&secrets.telegram_bot_token)?);
    let collaborators = RelayCollaborators {
        source: Arc::new(RedditClient::new(&secrets)?),
        destination: telegram.clone(),
        notifier: telegram.clone(),
        preparer: Arc::new(pipeline),
    };

    let relay = Relay::new(config, stores, collaborators).await?;
    let recovered = relay.start().await.context("Failed to start the relay")?;
    info!(
        command = "run",
        requeued = recovered.requeued.len(),
        unsubmitted = recovered.unsubmitted.len(),
        "Relay running, press Ctrl-C to stop"
    );

    let cancel = CancellationToken::new();
    let poller = tokio::spawn({
        let telegram = Arc::clone(&telegram);
        let decisions = relay.decision_sender();
        let cancel = cancel.clone();
        async move { telegram.poll_decisions(decisions, cancel).await }
    });

    let interrupted = tokio::signal::ctrl_c().await;
    info!(command = "run", "Shutdown requested");
    cancel.cancel();
    if let Err(e) = poller.await {
        error!(error = %e, "Telegram poller panicked");
    }
    relay.stop().await.context("Failed to stop the relay cleanly")?;
    interrupted.context("Failed to listen for Ctrl-C")?;
    info!(command = "run", "Relay stopped");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
