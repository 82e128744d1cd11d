//! Telemesh CLI
//!
//! Thin driver over the core: open an endpoint, dial identities,
//! listen for channels, and pipe packets between a channel and
//! stdin/stdout. Exits 0 on clean close, nonzero on a broken
//! exchange.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use telemesh_core::{Config, Endpoint, Identity};

/// Telemesh - encrypted P2P overlay endpoint
#[derive(Parser)]
#[command(name = "telemesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind the UDP transport to
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an endpoint and print its identity document
    Open,

    /// Establish an exchange with a peer identity
    Dial {
        /// Path to the peer's identity document (JSON)
        identity: PathBuf,
    },

    /// Accept channels of a type and print their packets
    Listen {
        /// Channel type to accept
        typ: String,
    },

    /// Open a channel to a peer and pipe stdin/stdout through it
    OpenChannel {
        /// Path to the peer's identity document (JSON)
        identity: PathBuf,

        /// Channel type to open
        typ: String,

        /// Use an unreliable channel
        #[arg(short, long)]
        unreliable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let endpoint = Endpoint::open(cli.bind, Config::default())
        .await
        .context("Failed to open endpoint")?;
    print_identity(&endpoint)?;

    match cli.command {
        Commands::Open => {
            info!("Endpoint {} ready, ctrl-c to exit", endpoint.hashname());
            tokio::signal::ctrl_c().await?;
            endpoint.close().await;
        }

        Commands::Dial { identity } => {
            let ident = load_identity(&identity)?;
            info!("Dialing {}", ident.hashname());
            let exchange = endpoint.dial(&ident).await?;
            println!("open {}", exchange.remote_hashname());
            endpoint.close().await;
        }

        Commands::Listen { typ } => {
            let mut listener = endpoint.listen(&typ);
            info!("Listening for {:?} channels, ctrl-c to exit", typ);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    accepted = listener.accept() => {
                        let channel = accepted?;
                        info!(
                            "Accepted channel {} from {}",
                            channel.id(),
                            channel.remote_hashname()
                        );
                        tokio::spawn(async move {
                            let mut stdout = tokio::io::stdout();
                            while let Ok(Some(body)) = channel.read_packet().await {
                                let _ = stdout.write_all(&body).await;
                                let _ = stdout.write_all(b"\n").await;
                                let _ = stdout.flush().await;
                            }
                            if let Err(e) = channel.close().await {
                                warn!("Channel close failed: {}", e);
                            }
                        });
                    }
                }
            }
            endpoint.close().await;
        }

        Commands::OpenChannel {
            identity,
            typ,
            unreliable,
        } => {
            let ident = load_identity(&identity)?;
            let exchange = endpoint.dial(&ident).await?;
            let channel = exchange.open(&typ, !unreliable).await?;
            info!("Channel {:?} {} open", typ, channel.id());

            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();

            loop {
                tokio::select! {
                    line = stdin.next_line() => match line? {
                        Some(line) => channel.write_packet(line.as_bytes()).await?,
                        None => break,
                    },
                    pkt = channel.read_packet() => match pkt? {
                        Some(body) => {
                            stdout.write_all(&body).await?;
                            stdout.write_all(b"\n").await?;
                            stdout.flush().await?;
                        }
                        None => break,
                    },
                }
            }

            channel.close().await?;
            endpoint.close().await;
        }
    }

    Ok(())
}

fn print_identity(endpoint: &Endpoint) -> Result<()> {
    let json = endpoint.local_identity()?.to_json()?;
    eprintln!("{}", String::from_utf8_lossy(&json));
    Ok(())
}

fn load_identity(path: &PathBuf) -> Result<Identity> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read identity file {}", path.display()))?;
    Ok(Identity::from_json(&data)?)
}
