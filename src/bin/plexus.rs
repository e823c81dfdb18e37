//! Plexus CLI binary.
//!
//! # Commands
//!
//! - `loopback` - Run two in-process stacks and echo data across negotiated calls
//! - `config` - Print the effective configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use plexus::{
    Ability, Config, Dimension, ExtensionLayer, IdentityModifier, InvocationHandler,
    MemoryNetwork, MuxTransport, RequirementSet, Session, Stack, StaticCapabilities,
    StreamConnector, SystemId, VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(name = "plexus")]
#[command(version = VERSION)]
#[command(about = "Plexus - requirement-driven middleware runtime", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/plexus/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo data between two in-process stacks over one multiplexed link
    Loopback {
        /// Number of concurrent calls
        #[arg(short = 'n', long, default_value = "8")]
        calls: usize,

        /// Bytes echoed per call
        #[arg(short, long, default_value = "65536")]
        size: usize,

        /// Require the compression layer
        #[arg(long)]
        compress: bool,

        /// Enable debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the effective configuration
    Config,
}

const TRANSPORT_ABILITY: Ability = Ability::new(0x01, 0x01);
const IDENTITY_ABILITY: Ability = Ability::new(0x00, 0x01);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Loopback {
            calls,
            size,
            compress,
            verbose,
        } => {
            init_logging(verbose);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_loopback(config, calls, size, compress))
        },
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    match Config::default_path().filter(|p| p.exists()) {
        Some(path) => Ok(Config::from_file(path)?),
        None => {
            let config = Config::from_env();
            config.validate()?;
            Ok(config)
        },
    }
}

/// Writes every received byte back to the caller.
struct Echo;

#[async_trait]
impl InvocationHandler for Echo {
    async fn handle(&self, session: Session, connector: StreamConnector) {
        let (mut reader, mut writer) = tokio::io::split(connector);
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(bytes) => tracing::debug!(call = %session.id(), bytes, "echo finished"),
            Err(e) => tracing::warn!(call = %session.id(), "echo failed: {}", e),
        }
    }
}

fn build_stack(
    id: &str,
    network: &Arc<MemoryNetwork>,
    registry: &Arc<StaticCapabilities>,
    config: &Config,
) -> anyhow::Result<(Stack, Arc<MuxTransport>)> {
    let local = SystemId::new(id);
    let stack = Stack::new(local.clone(), registry.clone(), config.clone())?;
    let transport = MuxTransport::new(
        TRANSPORT_ABILITY,
        network.dialer(local.clone()),
        config.multiplexer.clone(),
    );
    stack.install(transport.clone())?;
    stack.install(Arc::new(IdentityModifier::new(
        ExtensionLayer::Compression,
        IDENTITY_ABILITY,
    )))?;
    network.register(local.clone(), &transport);
    registry.advertise(local, &stack.advertised_capabilities());
    Ok((stack, transport))
}

async fn cmd_loopback(
    config: Config,
    calls: usize,
    size: usize,
    compress: bool,
) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let registry = Arc::new(StaticCapabilities::new());
    let (alpha, alpha_transport) = build_stack("alpha", &network, &registry, &config)?;
    let (beta, _beta_transport) = build_stack("beta", &network, &registry, &config)?;
    alpha.start(Arc::new(Echo))?;
    beta.start(Arc::new(Echo))?;

    let mut requirements = RequirementSet::new();
    if compress {
        requirements = requirements.with(ExtensionLayer::Compression, Dimension::required());
    }

    let target = SystemId::new("beta");
    let started = Instant::now();
    let results = futures::future::join_all((0..calls).map(|call| {
        let alpha = &alpha;
        let target = &target;
        let requirements = &requirements;
        async move {
            let payload: Vec<u8> = (0..size).map(|i| (i + call) as u8).collect();
            let mut connector = alpha.connect(target, requirements).await?;
            connector.write_all(&payload).await?;
            let mut echoed = vec![0u8; size];
            connector.read_exact(&mut echoed).await?;
            connector.release();
            anyhow::ensure!(echoed == payload, "call {call}: echoed bytes differ");
            Ok::<usize, anyhow::Error>(payload.len())
        }
    }))
    .await;

    let mut total = 0;
    for result in results {
        total += result?;
    }
    let elapsed = started.elapsed();

    println!("Calls:          {calls}");
    println!("Bytes echoed:   {total}");
    println!("Physical links: {}", alpha_transport.link_count());
    println!("Elapsed:        {:.2?}", elapsed);

    alpha.stop()?;
    beta.stop()?;
    Ok(())
}
