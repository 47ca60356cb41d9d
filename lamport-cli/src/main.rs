mod handlers;
mod server;
mod simulate;
mod transport;


use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use lamport_core::codec;
use lamport_core::config::AddressTable;
use lamport_core::types::{Message, MessageKind, NodeId};

/// HTTP control ports default to this plus the node id.
const DEFAULT_HTTP_PORT_BASE: u16 = 3100;

#[derive(Parser)]
#[command(
    name = "lamport",
    about = "Lamport — decentralised mutual exclusion for a fixed set of peers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one peer node with its HTTP control API
    Serve {
        /// Cluster file (TOML). Without it the TOTAL_NODES / NODE_<i>_IP /
        /// NODE_<i>_PORT variables are read
        #[arg(short, long, env = "LAMPORT_CONFIG")]
        config: Option<PathBuf>,

        /// This node's id in the cluster
        #[arg(long, env = "LAMPORT_NODE_ID")]
        id: u32,

        /// Host for the control API
        #[arg(long, default_value = "127.0.0.1")]
        http_host: String,

        /// Port for the control API [default: 3100 + id]
        #[arg(long, env = "LAMPORT_HTTP_PORT")]
        http_port: Option<u16>,

        /// Event log: "tracing", "memory" or "sqlite:<path>"
        #[arg(long, default_value = "tracing", env = "LAMPORT_EVENTS")]
        events: String,
    },

    /// Decode a wire message from stdin and print it as JSON
    Decode,

    /// Print the wire form of a message
    Encode {
        #[arg(long)]
        id: u32,

        #[arg(long)]
        timestamp: u64,

        #[arg(long, value_enum)]
        kind: KindArg,

        /// Defaults to the usual content for the kind
        #[arg(long)]
        content: Option<String>,
    },

    /// Run an in-process cluster and check that entries never overlap
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: u32,

        #[arg(long, default_value_t = 5)]
        rounds: usize,
    },

    /// Print version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Request,
    Reply,
    Release,
}

impl From<KindArg> for MessageKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Request => MessageKind::Request,
            KindArg::Reply => MessageKind::Reply,
            KindArg::Release => MessageKind::Release,
        }
    }
}

fn load_table(config: Option<PathBuf>) -> anyhow::Result<AddressTable> {
    match config {
        Some(path) => AddressTable::load(&path)
            .with_context(|| format!("loading cluster file {}", path.display())),
        None => AddressTable::from_env_vars(std::env::vars())
            .context("no --config given and the TOTAL_NODES layout is incomplete"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            http_host,
            http_port,
            events,
        } => {
            let id = NodeId::new(id).context("node id must be a positive integer")?;
            let table = load_table(config)?;
            let http_port = match http_port {
                Some(port) => port,
                None => u16::try_from(id.get())
                    .ok()
                    .and_then(|n| DEFAULT_HTTP_PORT_BASE.checked_add(n))
                    .context("node id too large for a default HTTP port; pass --http-port")?,
            };
            server::run(table, id, &http_host, http_port, &events).await?;
        }
        Commands::Decode => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("failed to read stdin")?;

            let payload = input.trim_end_matches(['\r', '\n']);
            let message = codec::decode(payload.as_bytes())?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Commands::Encode {
            id,
            timestamp,
            kind,
            content,
        } => {
            let sender = NodeId::new(id).context("sender id must be a positive integer")?;
            let kind = MessageKind::from(kind);
            let content = content.unwrap_or_else(|| kind.default_content().to_string());
            println!("{}", Message::new(sender, timestamp, kind, content));
        }
        Commands::Simulate { nodes, rounds } => {
            let report = tokio::task::spawn_blocking(move || simulate::run(nodes, rounds)).await??;
            let order: Vec<String> = report.entry_order.iter().map(|n| n.to_string()).collect();
            println!(
                "{} entries, {} messages, {:?}",
                report.entry_order.len(),
                report.messages,
                report.elapsed
            );
            println!("entry order: {}", order.join(" "));
        }
        Commands::Version => {
            println!("lamport {}", env!("CARGO_PKG_VERSION"));
            println!("Lamport mutual exclusion over a static peer table");
        }
    }

    Ok(())
}
