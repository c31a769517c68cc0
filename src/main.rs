//! claimlink - device pairing daemon
//!
//! CLI for running the pairing loop and inspecting its state on the bench.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use claimlink::config::Config;
use claimlink::config_session::{ConfigLink, LinkStatus};
use claimlink::network::CommandNetwork;
use claimlink::pairing::{PairingStateMachine, Phase};
use claimlink::store::DeviceStore;
use claimlink::token::hardware_tag;
use claimlink::transport::inbox::{LocalInbox, NewMessage};
use claimlink::transport::telegram::TelegramTransport;
use claimlink::transport::{ChatId, ChatKind, ClaimTransport};
use claimlink::Error;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// claimlink - pair a headless device with its owner over chat
#[derive(Parser)]
#[command(name = "claimlink")]
#[command(about = "Pair a headless device with its owner over chat")]
struct Cli {
    /// State directory (overrides CLAIMLINK_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pairing loop in the foreground
    ///
    /// Configuration payloads are read as JSON lines on stdin; link status
    /// and token notifications are written to stdout.
    Run {
        /// Claim transport
        #[arg(long, value_enum, default_value = "inbox")]
        transport: TransportKind,
    },

    /// Show the persisted device record
    Status,

    /// Forget the persisted pairing
    Reset,

    /// Append a message to the local inbox
    Inject {
        /// Chat ID
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,

        /// Message text
        text: String,

        /// Sender handle
        #[arg(long)]
        sender: String,

        /// Conversation kind (private, group, channel)
        #[arg(long, default_value = "private")]
        kind: String,

        /// Group title
        #[arg(long)]
        title: Option<String>,
    },

    /// List messages the device sent through the local inbox
    Outbox {
        /// Number of messages to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    Inbox,
    Telegram,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout belongs to the configuration link
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env().context("Invalid CLAIMLINK_* environment")?;
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(&dir);
    }

    match cli.command {
        Commands::Run { transport } => cmd_run(&config, transport),
        Commands::Status => cmd_status(&config),
        Commands::Reset => cmd_reset(&config),
        Commands::Inject {
            chat_id,
            text,
            sender,
            kind,
            title,
        } => cmd_inject(&config, chat_id, &text, &sender, &kind, title),
        Commands::Outbox { lines } => cmd_outbox(&config, lines),
    }
}

// ============================================================================
// CLI Commands
// ============================================================================

fn cmd_run(config: &Config, transport: TransportKind) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let network = Arc::new(CommandNetwork::new(config));

    match transport {
        TransportKind::Inbox => {
            let inbox = LocalInbox::open(&config.inbox_db)
                .with_context(|| format!("Failed to open inbox {}", config.inbox_db.display()))?;
            runtime.block_on(run_loop(config, inbox, network))
        }
        TransportKind::Telegram => {
            let token = config
                .bot_token
                .as_deref()
                .ok_or_else(|| Error::Config("CLAIMLINK_BOT_TOKEN is not set".to_string()))?;
            let telegram = TelegramTransport::new(
                &config.api_base,
                token,
                Duration::from_secs(config.http_timeout_secs),
            )?;
            runtime.block_on(run_loop(config, telegram, network))
        }
    }
}

async fn run_loop<T: ClaimTransport>(
    config: &Config,
    transport: T,
    network: Arc<CommandNetwork>,
) -> Result<()> {
    let (mut machine, link) = PairingStateMachine::new(
        config,
        transport,
        Arc::clone(&network),
        network,
        Instant::now(),
    );
    info!(
        device = %machine.device_tag(),
        phase = %machine.phase(),
        state_dir = %config.state_dir.display(),
        "claimlink starting"
    );

    spawn_link_reader(link.clone())?;

    let mut status_events = link.status_events();
    let mut token_rx = link.token_receiver();
    print_status(&link.status());

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let restart_delay = Duration::from_secs(config.restart_delay_secs);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut phase = machine.phase();
    let mut failed_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(phase = %phase, "Interrupted, shutting down");
                break;
            }
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let current = machine.tick(now).await;
        if current != phase {
            info!(from = %phase, to = %current, "Phase changed");
            phase = current;
        }

        if current == Phase::Failed {
            let since = *failed_at.get_or_insert(now);
            if now.duration_since(since) >= restart_delay {
                machine.restart(now);
                failed_at = None;
                phase = machine.phase();
            }
        } else {
            failed_at = None;
        }

        loop {
            match status_events.try_recv() {
                Ok(status) => print_status(&status),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status feed lagged, some transitions not printed");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if token_rx.has_changed().unwrap_or(false) {
            if let Some(token) = token_rx.borrow_and_update().clone() {
                println!("{}", serde_json::json!({ "token": token }));
            }
        }
    }

    Ok(())
}

fn print_status(status: &LinkStatus) {
    println!("{}", serde_json::json!({ "status": status.as_str() }));
}

/// Feed stdin lines to the configuration link.
///
/// Runs on a plain thread: a blocked stdin read must not hold up runtime
/// shutdown.
fn spawn_link_reader(link: ConfigLink) -> Result<()> {
    std::thread::Builder::new()
        .name("config-link".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !link.write(line.as_bytes()) {
                    break;
                }
            }
            debug!("Configuration link closed");
        })
        .context("Failed to spawn link reader")?;
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Device: {}", hardware_tag(&config.hardware_id));

    let store = DeviceStore::new(config);
    let record = store
        .load()
        .with_context(|| format!("Failed to read {}", store.path().display()))?;

    let Some(record) = record else {
        println!("Not configured");
        return Ok(());
    };

    println!("Record: {}", store.path().display());
    println!("  configured:    {}", record.configured);
    if let Some(credentials) = &record.credentials {
        println!("  ssid:          {}", credentials.ssid);
        println!("  password:      <redacted>");
        println!("  owner:         {}", credentials.owner_identity);
    }
    println!("  personal chat: {}", display_chat(record.binding.personal_chat_id()));
    println!("  group chat:    {}", display_chat(record.binding.group_chat_id()));
    if let Some(paired_at) = record.paired_at {
        println!("  paired at:     {}", paired_at.to_rfc3339());
    }
    println!("  updated at:    {}", record.updated_at.to_rfc3339());

    Ok(())
}

fn display_chat(chat: Option<ChatId>) -> String {
    chat.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn cmd_reset(config: &Config) -> Result<()> {
    let store = DeviceStore::new(config);
    if store.clear().context("Failed to remove device record")? {
        println!("Removed {}", store.path().display());
    } else {
        println!("Nothing to reset");
    }
    Ok(())
}

fn cmd_inject(
    config: &Config,
    chat_id: i64,
    text: &str,
    sender: &str,
    kind: &str,
    title: Option<String>,
) -> Result<()> {
    let chat_kind: ChatKind = kind.parse()?;
    let inbox = LocalInbox::open(&config.inbox_db)
        .with_context(|| format!("Failed to open inbox {}", config.inbox_db.display()))?;

    let seq = inbox.inject(&NewMessage {
        chat_id: ChatId(chat_id),
        chat_kind,
        chat_title: title,
        sender: sender.to_string(),
        text: text.to_string(),
    })?;

    println!("Injected message {} into {} chat {}", seq, chat_kind, chat_id);
    Ok(())
}

fn cmd_outbox(config: &Config, lines: usize) -> Result<()> {
    let inbox = LocalInbox::open(&config.inbox_db)
        .with_context(|| format!("Failed to open inbox {}", config.inbox_db.display()))?;

    let entries = inbox.outbox(lines)?;
    if entries.is_empty() {
        println!("Outbox is empty");
        return Ok(());
    }

    for entry in entries {
        println!("[{}] {}: {}", entry.sent_at, entry.chat_id, entry.text);
    }
    Ok(())
}
