//! CLI entry point for running one sharded-kv node with a line-based REPL.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- --id 1 \
//!   --peer 1=127.0.0.1:7201,2=127.0.0.1:7202,3=127.0.0.1:7203
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- --id 2 \
//!   --peer 1=127.0.0.1:7201,2=127.0.0.1:7202,3=127.0.0.1:7203
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- --id 3 \
//!   --peer 1=127.0.0.1:7201,2=127.0.0.1:7202,3=127.0.0.1:7203
//! ```
//!
//! Everything else (shard count, replication factor, timeouts) comes from
//! an optional JSON file passed with `--config`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use sharded_kv::console::{ConsoleCommand, HELP};
use sharded_kv::runtime::start_tcp_node;
use sharded_kv::{Config, KvError, Node};

/// Command-line arguments for a node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a sharded-kv node with an interactive shell")]
struct Args {
    /// JSON config file; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: Option<u64>,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Directory for WAL and term files
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Refuse PUT and DELETE from this shell
    #[arg(long)]
    read_only: bool,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn parse_peers(entries: &[String]) -> Result<BTreeMap<u64, SocketAddr>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow::anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        peers.insert(id, addr);
    }
    Ok(peers)
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(id) = args.id {
        config.node_id = id;
    }
    let peers = parse_peers(&args.peer)?;
    if !peers.is_empty() {
        config.peers = peers;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate().context("invalid node configuration")?;
    Ok(config)
}

async fn execute(node: &Node, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Put { key, value } => match node.put(&key, value).await {
            Ok(sequence) => println!("OK (shard {}, seq {sequence})", node.shard_for(&key)),
            Err(err) => println!("ERROR: {err}"),
        },
        ConsoleCommand::Get { key } => match node.get(&key).await {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(KvError::NotFound) => println!("(not found)"),
            Err(err) => println!("ERROR: {err}"),
        },
        ConsoleCommand::Delete { key } => match node.delete(&key).await {
            Ok(sequence) => println!("DELETED (shard {}, seq {sequence})", node.shard_for(&key)),
            Err(err) => println!("ERROR: {err}"),
        },
        ConsoleCommand::Status => print!("{}", node.status().await?),
        ConsoleCommand::Elect => {
            node.run_elections().await;
            println!("election round finished");
        }
        ConsoleCommand::Heal => {
            node.mark_storage_healthy();
            println!("storage marked healthy");
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = build_config(&args)?;
    let node = start_tcp_node(config, None)
        .await
        .context("failed to start node")?;
    info!(node = node.id(), "ready; type HELP (or h) for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line, !args.read_only) {
            Ok(command) => {
                if !execute(&node, command).await? {
                    break;
                }
            }
            Err(err) => warn!("{err}"),
        }
    }

    node.shutdown();
    Ok(())
}
