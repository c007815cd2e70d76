use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chat_relay::{Config, Daemon};

/// Chat relay - answers chat messages with a language model
#[derive(Parser)]
#[command(name = "chat-relay", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Join a room by id or alias
    Join {
        /// Room id (`!abc:example.org`) or alias (`#room:example.org`)
        room: String,
    },
    /// Invite a user, creating a direct room if needed
    Invite {
        /// User id to invite
        user: String,
        /// Existing room to invite into
        #[arg(short, long)]
        room: Option<String>,
        /// Always create a new room
        #[arg(long)]
        create: bool,
    },
    /// Print the effective configuration and joined rooms
    Debug,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,chat_relay=info",
        1 => "info,chat_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    let daemon = Daemon::new(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_relay(&daemon).await,
        Command::Join { room } => {
            let joined = daemon.join(&room).await?;
            println!("Joined {joined}");
            Ok(())
        }
        Command::Invite { user, room, create } => {
            let target = daemon.invite(&user, room.as_deref(), create).await?;
            println!("Invited {user} to {target}");
            Ok(())
        }
        Command::Debug => cmd_debug(&daemon).await,
    }
}

/// Run until Ctrl-C or credential rejection
async fn run_relay(daemon: &Daemon) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    tracing::info!("chat relay ready");
    daemon.run(cancel).await?;
    tracing::info!("chat relay stopped");
    Ok(())
}

async fn cmd_debug(daemon: &Daemon) -> anyhow::Result<()> {
    println!("Configuration:\n{:#?}\n", daemon.config());

    let rooms = daemon.debug().await?;
    println!("Joined rooms: {}", rooms.len());
    for room in rooms {
        match room.members {
            Some(members) => println!("  {} ({members} members)", room.room_id),
            None => println!("  {} (members unknown)", room.room_id),
        }
    }

    Ok(())
}
