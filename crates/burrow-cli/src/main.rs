//! Burrow CLI
//!
//! Key generation, configuration and a loopback connection demo.

mod config;

use anyhow::Context;
use burrow_core::{ConnectOptions, Node, NodeConfig};
use burrow_crypto::KeyPair;
use burrow_discovery::{MemoryNetwork, NatBehavior};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use config::Config;

/// Burrow - reach peers by public key through NATs
#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity key pair
    Keygen {
        /// Where to store the key seed (defaults to the configured key file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Connect two in-process nodes over loopback and exchange a message
    Demo {
        /// Put both nodes behind consistent NATs so they must holepunch
        #[arg(long)]
        firewalled: bool,

        /// Message the client sends
        #[arg(short, long, default_value = "hello from burrow")]
        message: String,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match &cli.config {
        // An explicit path must exist
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default(&config_path)?,
    };
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.identity.key_file.clone());
            generate_keypair(&path, force)?;
        }
        Commands::Demo { firewalled, message } => {
            run_demo(&config, firewalled, &message).await?;
        }
        Commands::Config { write } => {
            show_config(&config, &config_path, write)?;
        }
    }

    Ok(())
}

/// Generate a key pair and store its seed as hex.
fn generate_keypair(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let keys = KeyPair::generate(&mut rand_core::OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = Zeroizing::new(hex::encode(keys.seed().as_slice()));
    std::fs::write(path, encoded.as_bytes())?;

    println!("Public key: {}", keys.public_key());
    println!("Seed saved to: {}", path.display());
    Ok(())
}

/// Load the identity from `path`, if present.
fn load_keypair(path: &Path) -> anyhow::Result<Option<KeyPair>> {
    if !path.exists() {
        return Ok(None);
    }
    let encoded = Zeroizing::new(std::fs::read_to_string(path)?);
    let bytes = Zeroizing::new(hex::decode(encoded.trim()).context("key file is not hex")?);
    let seed: &[u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file must hold a 32-byte seed"))?;
    Ok(Some(KeyPair::from_seed(seed)))
}

/// Three relays, a server and a client on one in-memory DHT.
async fn run_demo(config: &Config, firewalled: bool, message: &str) -> anyhow::Result<()> {
    let mut node_config: NodeConfig = config.to_node_config()?;
    node_config.pool.bind_host = Ipv4Addr::LOCALHOST;

    let net = MemoryNetwork::new();
    let relays: Vec<Node> = (0..3)
        .map(|_| Node::new(net.add_node(false, NatBehavior::Open), node_config.clone()))
        .collect();
    let behavior = if firewalled { NatBehavior::Consistent } else { NatBehavior::Open };
    let server_node = Node::new(net.add_node(firewalled, behavior), node_config.clone());
    let client_node = Node::new(net.add_node(firewalled, behavior), node_config);

    let server_keys = match load_keypair(&config.identity.key_file)? {
        Some(keys) => keys,
        None => KeyPair::generate(&mut rand_core::OsRng),
    };
    let server = server_node.create_server(None)?;
    server.listen(server_keys.clone()).await?;
    println!("Server:  {}", server_keys.public_key());
    println!("Relays:  {:?}", server.relay_addresses());
    if let Some(address) = server.address() {
        println!("Direct:  {}", address);
    }

    let echo = tokio::spawn({
        let server = server.clone();
        async move {
            let stream = server.accept().await?;
            let received = stream.recv().await.ok()?;
            stream.send(&received).await.ok()?;
            Some(received)
        }
    });

    let client_keys = KeyPair::generate(&mut rand_core::OsRng);
    let stream = client_node
        .connect(&client_keys, &server_keys.public_key(), ConnectOptions::default())
        .await
        .context("connect failed")?;
    println!("Client:  {} at {}", client_keys.public_key(), stream.local_address());
    println!("Stream:  {} -> {}", stream.local_address(), stream.remote_address());

    stream.send(message.as_bytes()).await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .context("no echo within 5s")??;
    println!("Echo:    {}", String::from_utf8_lossy(&reply));
    if echo.await?.is_none() {
        tracing::warn!("server side of the demo ended early");
    }

    stream.close();
    client_node.destroy().await;
    server_node.destroy().await;
    for relay in relays {
        relay.destroy().await;
    }
    Ok(())
}

/// Print the configuration as TOML.
fn show_config(config: &Config, path: &Path, write: bool) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);
    if write {
        config.save(path)?;
        println!("Written to {}", path.display());
    }
    Ok(())
}
