//! smp - Secured MQTT Publisher command line
//!
//! Drives the publisher core from a terminal:
//! 1. Publishes configured actions over mutual-TLS MQTT
//! 2. Handles trigger and share URLs as if read from a tag or QR code
//! 3. Provisions emulated NFC tags and manages per-action secrets

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use secured_publisher::app::{PublisherDeps, TriggerOutcome, UrlOutcome};
use secured_publisher::crypto::{key_fingerprint, verify_timestamp_block};
use secured_publisher::rendezvous::{FeedbackCue, RendezvousTiming, SessionOutcome};
use secured_publisher::transport::{MockTransport, MqttTransport, RumqttTransport};
use secured_publisher::{
    FileTag, JsonFileSettingsStore, Publisher, PublisherConfig, Settings, SettingsStore,
    TagSession, TriggerFeedback,
};

/// Device-side tolerance for encrypted timestamps.
const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 9;

#[derive(Parser, Debug)]
#[command(author, version, about = "Secured MQTT Publisher")]
struct Args {
    /// Settings file (overrides config and SMP_SETTINGS_PATH).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Emulated NFC tag file (overrides config and SMP_TAG_PATH).
    #[arg(long)]
    tag: Option<PathBuf>,

    /// Use an in-memory transport instead of a real broker.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write default settings if none exist.
    Init,
    /// Publish the action bound to a button.
    Publish { index: usize },
    /// Handle a trigger or share URL.
    Url {
        url: String,
        /// Store the key carried by an unknown tag.
        #[arg(long)]
        accept_import: bool,
    },
    /// Read the emulated tag and handle its URL.
    ReadTag {
        #[arg(long)]
        accept_import: bool,
    },
    /// Write a fresh trigger URL to the emulated tag and store its secret.
    Provision {
        index: usize,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the share URL of a stored secret.
    ShareUrl { index: usize, secret_id: Uuid },
    /// Check an encrypted timestamp block the way a receiving device does.
    VerifyTimestamp {
        key: String,
        block: String,
        #[arg(long, default_value_t = DEFAULT_TIMESTAMP_TOLERANCE_SECS)]
        tolerance: u64,
    },
    /// Manage per-action secrets.
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SecretsCommand {
    List,
    Remove { index: usize, secret_id: Uuid },
    RemoveAll { index: usize },
    Rename {
        index: usize,
        secret_id: Uuid,
        label: Option<String>,
    },
}

struct ConsoleFeedback;

impl TriggerFeedback for ConsoleFeedback {
    fn countdown(&self, action_title: &str, remaining: u32) {
        println!("Executing \"{}\" in {}... (Ctrl-C to cancel)", action_title, remaining);
    }

    fn cue(&self, cue: FeedbackCue) {
        log::debug!("cue {:?}", cue);
    }

    fn failed(&self, message: &str) {
        eprintln!("Failed: {}", message);
    }

    fn request_background(&self) {
        log::debug!("background requested");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = PublisherConfig::load()?;
    if let Some(path) = args.settings {
        config.settings_path = path;
    }
    if let Some(path) = args.tag {
        config.tag_path = path;
    }

    if let Command::VerifyTimestamp {
        key,
        block,
        tolerance,
    } = &args.command
    {
        let now = secured_publisher::now_unix_secs()?;
        let ts = verify_timestamp_block(key, block, now, *tolerance)
            .map_err(|e| anyhow!("timestamp rejected: {}", e))?;
        println!("timestamp {} accepted (now {})", ts, now);
        return Ok(());
    }

    let store = Arc::new(JsonFileSettingsStore::new(&config.settings_path));
    if let Command::Init = args.command {
        if store.load()?.is_some() {
            println!("settings already present at {}", store.path().display());
        } else {
            store.save(&Settings::default())?;
            println!("wrote default settings to {}", store.path().display());
        }
        return Ok(());
    }

    let transport: Arc<dyn MqttTransport> = if args.dry_run {
        log::info!("dry run: using in-memory transport");
        Arc::new(MockTransport::new())
    } else {
        Arc::new(RumqttTransport::new())
    };
    let mut deps = PublisherDeps::new(transport);
    deps.feedback = Arc::new(ConsoleFeedback);
    let publisher = Publisher::new(
        store,
        deps,
        config.session_tuning(),
        RendezvousTiming::default(),
    )
    .context("failed to initialize publisher")?;

    let result = run(&publisher, &config, args.command).await;
    if let Err(e) = publisher.disconnect().await {
        log::warn!("disconnect failed: {}", e);
    }
    result
}

async fn run(publisher: &Publisher, config: &PublisherConfig, command: Command) -> Result<()> {
    match command {
        Command::Init | Command::VerifyTimestamp { .. } => Ok(()),
        Command::Publish { index } => {
            if let Err(e) = publisher.connect().await {
                log::warn!("connect failed: {}", e);
            }
            publisher
                .publish_action(index)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!("Published action {}", index);
            Ok(())
        }
        Command::Url { url, accept_import } => handle_url(publisher, &url, accept_import).await,
        Command::ReadTag { accept_import } => {
            let tag = FileTag::new(&config.tag_path);
            let url = tag.read_url().await.map_err(|e| anyhow!("{}", e))?;
            handle_url(publisher, url.as_str(), accept_import).await
        }
        Command::Provision { index, label } => {
            let tag = FileTag::new(&config.tag_path);
            let secret = publisher
                .provision_tag(&tag, index, label)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!(
                "Tag written to {} for action {} (secret {})",
                tag.path().display(),
                index,
                secret.id()
            );
            Ok(())
        }
        Command::ShareUrl { index, secret_id } => {
            let url = publisher
                .share_url(index, secret_id)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!("{}", url);
            Ok(())
        }
        Command::Secrets { command } => run_secrets(publisher, command).await,
    }
}

async fn handle_url(publisher: &Publisher, url: &str, accept_import: bool) -> Result<()> {
    match publisher.handle_url(url).await {
        UrlOutcome::Imported(grant) => {
            println!("Imported secret for action {}", grant.action_index);
            Ok(())
        }
        UrlOutcome::ImportRejected(e) => Err(anyhow!("{}", e)),
        UrlOutcome::Trigger(TriggerOutcome::Rejected { reason, .. }) => {
            Err(anyhow!("trigger rejected: {}", reason))
        }
        UrlOutcome::Trigger(TriggerOutcome::Failed(e)) => Err(anyhow!("{}", e)),
        UrlOutcome::Trigger(TriggerOutcome::Started {
            handle,
            pending_import,
        }) => {
            if let Some(grant) = &pending_import {
                if accept_import {
                    publisher
                        .accept_import()
                        .await
                        .map_err(|e| anyhow!("{}", e))?;
                    println!(
                        "Stored key {}… for action {}",
                        key_fingerprint(&grant.key_material),
                        grant.action_index
                    );
                } else {
                    println!("Tag carries a key this device does not store (use --accept-import to keep it)");
                }
            }

            let outcome = handle.outcome();
            tokio::pin!(outcome);
            let finished = tokio::select! {
                outcome = &mut outcome => Some(outcome),
                _ = tokio::signal::ctrl_c() => None,
            };
            let outcome = match finished {
                Some(outcome) => outcome,
                None => {
                    publisher.cancel_trigger();
                    outcome.await
                }
            };
            match outcome {
                SessionOutcome::Dispatched => {
                    println!("Published");
                    Ok(())
                }
                SessionOutcome::Cancelled => {
                    println!("Cancelled");
                    Ok(())
                }
                SessionOutcome::Failed(e) => Err(anyhow!("{}", e)),
            }
        }
    }
}

async fn run_secrets(publisher: &Publisher, command: SecretsCommand) -> Result<()> {
    match command {
        SecretsCommand::List => {
            let settings = publisher.settings().await;
            for (index, action) in settings.actions.iter().enumerate() {
                println!("[{}] {} ({})", index, action.title, action.topic);
                for secret in action.secrets() {
                    println!(
                        "    {} {}… created {} {}",
                        secret.id(),
                        key_fingerprint(secret.key_material()),
                        secret.created_at(),
                        secret.label().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        SecretsCommand::Remove { index, secret_id } => {
            publisher
                .remove_secret(index, secret_id)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!("Removed secret {}", secret_id);
            Ok(())
        }
        SecretsCommand::RemoveAll { index } => {
            let removed = publisher
                .remove_all_secrets(index)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!("Removed {} secrets from action {}", removed, index);
            Ok(())
        }
        SecretsCommand::Rename {
            index,
            secret_id,
            label,
        } => {
            publisher
                .rename_secret(index, secret_id, label)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            println!("Renamed secret {}", secret_id);
            Ok(())
        }
    }
}
