use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use revkv::server::{serve, ServeOptions};
use revkv::{Client, ClientConfig, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod demos;

#[derive(Parser, Debug)]
#[command(name = "kvtour")]
#[command(about = "Walkthrough of the revkv client API", long_about = None)]
struct Cli {
    #[command(flatten)]
    conn: ConnArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// Store endpoints, tried in order (e.g. "localhost:2379,localhost:22379")
    #[arg(
        long,
        global = true,
        value_delimiter = ',',
        default_value = "localhost:2379,localhost:22379,localhost:32379"
    )]
    endpoints: Vec<String>,

    /// Connection timeout in milliseconds
    #[arg(long, global = true, default_value_t = 2_000)]
    dial_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, default_value_t = 10_000)]
    request_timeout_ms: u64,
}

impl ConnArgs {
    fn config(&self) -> ClientConfig {
        ClientConfig::new(self.endpoints.iter().cloned())
            .with_dial_timeout(Duration::from_millis(self.dial_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a store and serve its API
    Serve {
        /// HTTP listen address
        #[arg(short, long, default_value = "127.0.0.1:2379")]
        addr: SocketAddr,

        /// Member id reported in response headers
        #[arg(short, long, default_value_t = 1)]
        id: u64,

        /// Data directory for the WAL and snapshots; memory only when absent
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Put, get, prefix get and a walk back through the history of key1
    Tour,
    /// Overwrite a key and read the earlier revision back
    SingleValue,
    /// Page through 50 keys ten at a time
    Pagination,
    /// Watch a prefix while keys are written
    Watch,
    /// Attach a key to a one second lease and watch it expire
    Lease,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, id, data_dir } => run_server(addr, id, data_dir).await,
        demo => run_demo(&cli.conn, demo).await,
    }
}

async fn run_demo(conn: &ConnArgs, demo: Commands) -> Result<()> {
    let client = Client::connect(conn.config())
        .await
        .context("Failed to connect to store")?;
    println!("\nCreate Done!");

    match demo {
        Commands::Tour => demos::tour(&client).await,
        Commands::SingleValue => demos::single_value(&client).await,
        Commands::Pagination => demos::pagination(&client).await,
        Commands::Watch => demos::watch(&client).await,
        Commands::Lease => demos::lease(&client).await,
        Commands::Serve { .. } => {}
    }

    client.close();
    Ok(())
}

async fn run_server(addr: SocketAddr, id: u64, data_dir: Option<PathBuf>) -> Result<()> {
    let store = match &data_dir {
        Some(dir) => Store::new_with_persistence(id, dir)?,
        None => Store::new(id),
    };
    info!("Starting store member {id} (persistence: {data_dir:?})");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    serve(listener, store, ServeOptions::default()).await
}
