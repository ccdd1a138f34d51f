use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use openair_core::sender::send_to;
use openair_core::{
    format_bytes, PreparedFile, Receiver, SessionEvent, TransferConfig, TransferError,
};
use storage::LocalStorage;

mod prompt;

use prompt::OperatorDecision;

#[derive(Parser, Debug)]
#[command(name = "openair", version, about = "OpenAir point-to-point file transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Config file (default: ~/.openair/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file with default settings
    Init {
        /// Directory received files are saved to
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Listen for incoming transfers
    Listen {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Output directory for received files
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Accept every offer without prompting
        #[arg(long, conflicts_with = "auto_reject")]
        auto_accept: bool,

        /// Reject every offer without prompting
        #[arg(long)]
        auto_reject: bool,

        /// Largest file accepted, in bytes
        #[arg(long)]
        max_size: Option<i64>,

        /// Handle each connection on its own task
        #[arg(long)]
        concurrent: bool,

        /// Seconds to wait for a sender's header
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send a file to a peer
    Send {
        /// File to send
        #[arg(long)]
        file: PathBuf,

        /// Peer address (host:port), defaults to localhost on the configured port
        #[arg(long)]
        peer: Option<String>,

        /// Seconds to wait for the receiver's answer
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the size and SHA-256 a send would announce
    Hash {
        /// File to hash
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.cmd {
        Commands::Init { dest, force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {}. Use --force to overwrite.",
                    config_path.display()
                );
            }

            let mut cfg = TransferConfig::default();
            if let Some(dest) = dest {
                cfg = cfg.with_dest_dir(dest);
            }
            cfg.ensure_dest_dir()?;
            cfg.save(&config_path)?;

            println!("✓ Config written: {}", config_path.display());
            println!("  Destination: {}", cfg.dest_dir.display());
            println!("  Listen port: {}", cfg.listen_port);
            println!("  Max file size: {}", format_bytes(cfg.max_file_size.max(0) as u64));
        }

        Commands::Listen {
            port,
            dest,
            auto_accept,
            auto_reject,
            max_size,
            concurrent,
            timeout,
        } => {
            let mut cfg = TransferConfig::load(&config_path)?;
            if let Some(port) = port {
                cfg.listen_port = port;
            }
            if let Some(dest) = dest {
                cfg.dest_dir = dest;
            }
            if let Some(max_size) = max_size {
                cfg.max_file_size = max_size;
            }
            if auto_accept {
                cfg.auto_accept = Some(true);
            } else if auto_reject {
                cfg.auto_accept = Some(false);
            }
            cfg.concurrent |= concurrent;
            if let Some(secs) = timeout {
                cfg = cfg.with_handshake_timeout(Duration::from_secs(secs));
            }

            listen_for_transfers(cfg).await?;
        }

        Commands::Send { file, peer, timeout } => {
            let mut cfg = TransferConfig::load(&config_path)?;
            if let Some(secs) = timeout {
                cfg = cfg.with_handshake_timeout(Duration::from_secs(secs));
            }
            let peer = peer.unwrap_or_else(|| format!("127.0.0.1:{}", cfg.listen_port));

            send_file(&cfg, &file, &peer).await?;
        }

        Commands::Hash { file } => {
            let prepared = PreparedFile::from_path(&file).await?;
            println!("{}  {}", prepared.meta.sha256, file.display());
            println!(
                "  Size: {} ({} bytes)",
                format_bytes(prepared.meta.byte_len()),
                prepared.meta.size
            );
        }
    }

    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openair")
        .join("config.json")
}

async fn send_file(cfg: &TransferConfig, file: &Path, peer: &str) -> Result<()> {
    println!("Calculating file hash...");
    let prepared = PreparedFile::from_path(file).await?;

    println!("\nPreparing to send:");
    println!("  File: {}", prepared.meta.name);
    println!("  Size: {}", format_bytes(prepared.meta.byte_len()));
    println!("  Hash: {}", prepared.meta.sha256);
    println!("  To:   {}", peer);

    let sent = send_to(peer, &prepared, cfg.handshake_timeout())
        .await
        .context("Transfer failed")?;

    println!("✓ Sent {} ({}) successfully", prepared.meta.name, format_bytes(sent));
    Ok(())
}

async fn listen_for_transfers(cfg: TransferConfig) -> Result<()> {
    use tokio::net::TcpListener;

    cfg.ensure_dest_dir()?;
    let storage = LocalStorage::new(cfg.dest_dir.clone())?;

    let addr = format!("0.0.0.0:{}", cfg.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!("✓ Listening on {}", addr);
    println!("  Output directory: {}", storage.dest_dir().display());
    println!("  Max file size: {}", format_bytes(cfg.max_file_size.max(0) as u64));
    println!("  Press Ctrl+C to stop");

    let decision = OperatorDecision::new(cfg.auto_accept);
    let receiver = Receiver::new(storage, decision, cfg).with_reporter(|event| {
        for line in status_lines(event) {
            println!("{}", line);
        }
    });
    receiver.serve(listener).await.context("Accept failed")?;

    Ok(())
}

fn status_lines(event: &SessionEvent<'_>) -> Vec<String> {
    match event {
        SessionEvent::Incoming { peer } => vec![format!("\n← Incoming connection from {}", peer)],
        SessionEvent::Finished { result: Ok(done), .. } => vec![
            format!("✓ File received: {}", done.path.display()),
            format!("  Size: {}", format_bytes(done.size)),
            format!("  SHA-256: {}", done.sha256),
        ],
        SessionEvent::Finished { result: Err(TransferError::DecisionRejected), .. } => {
            vec!["✗ Rejected".to_string()]
        }
        SessionEvent::Finished { result: Err(e), .. } => {
            vec![format!("✗ Transfer failed: {}", e)]
        }
    }
}
