use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use chain_replication::cli::{Cli, Command, DecryptArgs, KeygenArgs, RunArgs};
use chain_replication::frontend::{Client, Replies};
use chain_replication::protocol::{ConsoleCommand, HELP};
use chain_replication::runtime::spawn_node;
use chain_replication::storage::{Backend, SledBackend};
use chain_replication::storage::crypto::{decrypt, encode_key_pair, generate_key_pair, load_private_key};
use chain_replication::NodeHandle;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Keygen(args) => keygen(args),
        Command::Decrypt(args) => decrypt_records(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.into_config()?;
    let replies = Arc::new(Replies::new());
    let node = spawn_node(config, replies.clone())
        .await
        .context("failed to start node")?;
    let client = Client::new(replies, node.requests(), node.requests());
    info!(node = %node.name(), position = %node.position(), "ready, type HELP for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line, node.is_head(), node.is_tail()) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => execute(command, &node, &client),
            Err(err) => println!("{err}"),
        }
    }

    node.shutdown().await.context("shutdown failed")?;
    Ok(())
}

fn execute(command: ConsoleCommand, node: &NodeHandle, client: &Client) {
    match command {
        ConsoleCommand::Put { key, value } => {
            let client = client.clone();
            // The reply only arrives after every node has flushed.
            tokio::spawn(async move {
                match client.update(key.clone(), value.into_bytes()).await {
                    Ok(_) => println!("OK {key}"),
                    Err(err) => println!("PUT {key} failed: {err}"),
                }
            });
        }
        ConsoleCommand::Get { key } => {
            let client = client.clone();
            tokio::spawn(async move {
                match client.query(key.clone()).await {
                    Ok(response) => match response.value {
                        Some(value) => println!("{key} = {}", String::from_utf8_lossy(&value)),
                        None => println!("{key} not found"),
                    },
                    Err(err) => println!("GET {key} failed: {err}"),
                }
            });
        }
        ConsoleCommand::Status => {
            let status = node.status();
            println!(
                "{} ({}): pending={} in_memory={} dirty={} violations={} requests_stalled={} responses_stalled={}",
                status.name,
                status.position,
                status.pending,
                status.in_memory,
                status.dirty,
                status.violations,
                status.requests.stalled,
                status.responses.stalled,
            );
        }
        ConsoleCommand::Resume => node.resume(),
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => {}
    }
}

fn keygen(args: KeygenArgs) -> Result<()> {
    let (private_key, _) = generate_key_pair(args.bits)?;
    let pems = encode_key_pair(&private_key)?;
    fs::create_dir_all(&args.out_dir)?;
    let private_path = args.out_dir.join("private.pem");
    let public_path = args.out_dir.join("public.pem");
    fs::write(&private_path, pems.private_pem)
        .with_context(|| format!("failed to write {}", private_path.display()))?;
    fs::write(&public_path, pems.public_pem)
        .with_context(|| format!("failed to write {}", public_path.display()))?;
    info!(bits = args.bits, dir = %args.out_dir.display(), "wrote key pair");
    Ok(())
}

async fn decrypt_records(args: DecryptArgs) -> Result<()> {
    let pem = fs::read_to_string(&args.private_key)
        .with_context(|| format!("failed to read private key {}", args.private_key.display()))?;
    let private_key = load_private_key(&pem)?;
    let backend = SledBackend::open(&args.data_dir)
        .with_context(|| format!("failed to open {}", args.data_dir.display()))?;

    for (key, blob) in backend.entries().await? {
        if args.key.as_ref().is_some_and(|wanted| *wanted != key) {
            continue;
        }
        match decrypt(&private_key, &blob, args.modulus_bits) {
            Ok(value) => println!("{key} = {}", String::from_utf8_lossy(&value)),
            Err(err) => warn!(%key, error = %err, "failed to decrypt record"),
        }
    }
    Ok(())
}
