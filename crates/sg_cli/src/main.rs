mod console;
mod keystore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use console::{ConsoleDelegate, Event};
use keystore::{IdentityFile, KeyringFile, PublicEntry};
use sg_proto::{Content, Id};
use sg_session::{SessionConfig, SessionDriver, SessionState, TransportKind};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "stargate")]
#[command(about = "Encrypted messaging through a Stargate relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity
    Keygen {
        /// Name the identity is known by
        #[arg(long)]
        id: String,
        /// Where to write the identity (contains secrets)
        #[arg(long)]
        out: PathBuf,
    },

    /// Write the public half of an identity for sharing
    Export {
        #[arg(long)]
        identity: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Manage known peers
    Keyring {
        #[command(subcommand)]
        command: KeyringCommands,
    },

    /// Connect, send one text message and wait for its receipt
    Send {
        #[command(flatten)]
        session: SessionArgs,
        /// Receiver id
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
        /// Seconds to wait for the relay's receipt
        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// Connect and print inbound messages until Ctrl-C
    Listen {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Subcommand)]
enum KeyringCommands {
    /// Add a peer's exported public keys
    Add {
        #[arg(long)]
        keyring: PathBuf,
        /// Exported public entry
        #[arg(long)]
        public: PathBuf,
        /// Store under this id instead of the exported one
        #[arg(long)]
        id: Option<String>,
    },

    /// List known peers with their fingerprints
    List {
        #[arg(long)]
        keyring: PathBuf,
    },
}

#[derive(Args)]
struct SessionArgs {
    #[arg(long)]
    identity: PathBuf,
    #[arg(long)]
    keyring: PathBuf,
    /// JSON session config; defaults plus SG_* environment otherwise
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    relay_host: Option<String>,
    #[arg(long)]
    relay_port: Option<u16>,
    #[arg(long)]
    relay_id: Option<String>,
    /// Use UDP instead of TCP
    #[arg(long)]
    datagram: bool,
}

impl SessionArgs {
    fn config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)?,
            None => SessionConfig::from_env()?,
        };
        if let Some(host) = &self.relay_host {
            config.relay_host = host.clone();
        }
        if let Some(port) = self.relay_port {
            config.relay_port = port;
        }
        if let Some(id) = &self.relay_id {
            config.relay_id = Id::new(id.clone());
        }
        if self.datagram {
            config.transport = TransportKind::Datagram;
        }
        config.validate()?;
        Ok(config)
    }
}

/// A running session plus the delegate's event stream.
struct Connection {
    driver: Arc<SessionDriver>,
    task: tokio::task::JoinHandle<()>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Connection {
    async fn open(args: &SessionArgs) -> Result<Self> {
        let config = args.config()?;
        let identity = IdentityFile::load(&args.identity)?;
        let keyring = KeyringFile::load(&args.keyring)?.into_keyring(&identity)?;
        let handshake_timeout = Duration::from_secs(config.handshake_timeout_secs.max(1));

        let (delegate, events) = ConsoleDelegate::new();
        let driver = SessionDriver::connect(config, Arc::new(keyring), Arc::new(delegate), Handle::current())?;
        driver.login(identity.id.clone());
        let task = driver.start()?;

        let running = tokio::time::timeout(handshake_timeout, async {
            while driver.state() != SessionState::Running {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if running.is_err() {
            driver.close();
            bail!("relay session not established (state {:?})", driver.state());
        }
        info!(identity = %identity.id, "session running");
        Ok(Self { driver, task, events })
    }

    async fn close(self) -> Result<()> {
        self.driver.close();
        self.task.await?;
        Ok(())
    }
}

fn keygen(id: String, out: &Path) -> Result<()> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    let identity = IdentityFile::generate(Id::new(id));
    identity.save(out)?;
    println!("{} {}", identity.id, identity.public.fingerprint());
    Ok(())
}

async fn send(session: SessionArgs, to: String, text: String, wait: u64) -> Result<()> {
    let mut conn = Connection::open(&session).await?;
    if !conn.driver.send_content(None, Id::new(to), Content::text(text), 0) {
        conn.close().await?;
        bail!("message rejected");
    }

    let outcome = tokio::time::timeout(Duration::from_secs(wait), conn.events.recv()).await;
    conn.close().await?;
    match outcome {
        Ok(Some(Event::Delivered(receipt))) => {
            println!("delivered {receipt}");
            Ok(())
        }
        Ok(Some(Event::Stored(reason))) => Err(anyhow!("not delivered: {reason:?}")),
        Ok(None) => Err(anyhow!("session ended before delivery")),
        Err(_) => Err(anyhow!("no receipt within {wait}s")),
    }
}

async fn listen(session: SessionArgs) -> Result<()> {
    let conn = Connection::open(&session).await?;
    println!("listening as {}; Ctrl-C to stop", session.identity.display());
    tokio::signal::ctrl_c().await?;
    conn.close().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sg_session=info,stargate=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { id, out } => keygen(id, &out)?,

        Commands::Export { identity, out } => {
            IdentityFile::load(&identity)?.public_entry().save(&out)?;
        }

        Commands::Keyring { command } => match command {
            KeyringCommands::Add { keyring, public, id } => {
                let mut entry = PublicEntry::load(&public)?;
                if let Some(id) = id {
                    entry.id = Id::new(id);
                }
                let mut ring = KeyringFile::load(&keyring)?;
                let fingerprint = entry.public.fingerprint();
                let id = entry.id.clone();
                if ring.insert(entry).is_some() {
                    println!("replaced {id}");
                }
                ring.save(&keyring)?;
                println!("{id} {fingerprint}");
            }
            KeyringCommands::List { keyring } => {
                for (id, key) in KeyringFile::load(&keyring)?.contacts {
                    println!("{id} {}", key.fingerprint());
                }
            }
        },

        Commands::Send { session, to, text, wait } => send(session, to, text, wait).await?,

        Commands::Listen { session } => listen(session).await?,
    }

    Ok(())
}
