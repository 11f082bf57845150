use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_MODULUS_BITS, Endpoint, NodeConfig, StorageConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one replica node with an interactive console.
    Run(RunArgs),
    /// Generate a PEM-encoded RSA key pair for the storage engine.
    Keygen(KeygenArgs),
    /// Decrypt and print the durable records of a node's data directory.
    Decrypt(DecryptArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Node name used in logs and status output.
    #[arg(long)]
    pub name: String,

    /// Directory of the node's sled database.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// PEM file with the RSA public key that protects stored values.
    #[arg(long)]
    pub public_key: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MODULUS_BITS)]
    pub modulus_bits: usize,

    /// Accept the predecessor's connection on this address.
    #[arg(long, conflicts_with = "previous_connect")]
    pub previous_listen: Option<SocketAddr>,

    /// Dial the predecessor at this address.
    #[arg(long)]
    pub previous_connect: Option<SocketAddr>,

    /// Accept the successor's connection on this address.
    #[arg(long, conflicts_with = "next_connect")]
    pub next_listen: Option<SocketAddr>,

    /// Dial the successor at this address.
    #[arg(long)]
    pub next_connect: Option<SocketAddr>,

    /// Fixed delay between reconnect attempts of dialing endpoints.
    #[arg(long, default_value_t = 500)]
    pub reconnect_delay_ms: u64,
}

impl RunArgs {
    /// Reads the public key and assembles the node configuration.
    pub fn into_config(self) -> Result<NodeConfig> {
        let public_key_pem = std::fs::read_to_string(&self.public_key)
            .with_context(|| format!("failed to read public key {}", self.public_key.display()))?;
        if self.reconnect_delay_ms == 0 {
            bail!("--reconnect-delay-ms must be positive");
        }

        let mut storage = StorageConfig::new(self.data_dir, public_key_pem);
        storage.modulus_bits = self.modulus_bits;

        let mut config = NodeConfig::new(self.name, storage);
        config.previous = endpoint(self.previous_listen, self.previous_connect);
        config.next = endpoint(self.next_listen, self.next_connect);
        config.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        Ok(config)
    }
}

fn endpoint(listen: Option<SocketAddr>, connect: Option<SocketAddr>) -> Option<Endpoint> {
    listen.map(Endpoint::Listen).or(connect.map(Endpoint::Connect))
}

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    #[arg(long, default_value_t = DEFAULT_MODULUS_BITS)]
    pub bits: usize,

    /// Directory that receives `private.pem` and `public.pem`.
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DecryptArgs {
    #[arg(long)]
    pub data_dir: PathBuf,

    /// PEM file with the RSA private key matching the node's public key.
    #[arg(long)]
    pub private_key: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MODULUS_BITS)]
    pub modulus_bits: usize,

    /// Only print this key.
    #[arg(long)]
    pub key: Option<String>,
}
