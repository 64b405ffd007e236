//! Cosig Party CLI
//!
//! Local simulation driver for one gossip co-signing round:
//! - Run a round over an in-memory network and print the collective signature
//! - Print the roster generated for a seed

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cosig_core::gossip::VerificationFn;
use cosig_core::{
    CosigProtocol, KeyPair, MemoryNetwork, NodeContext, Parameters, PublicKey, Roster,
    ThresholdPolicy, Tree,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// Cosig Party - gossip BLS co-signing simulation
#[derive(Parser)]
#[command(name = "cosig-party")]
#[command(about = "Gossip-based BLS threshold co-signing, simulated in process")]
#[command(version)]
struct Cli {
    /// Number of participants
    #[arg(short, long, env = "COSIG_NODES", default_value_t = 4)]
    nodes: usize,

    /// Seed for key generation and peer selection
    #[arg(long, env = "COSIG_SEED", default_value_t = 0)]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one co-signing round
    Run {
        /// Message to co-sign
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Number of participants agreeing to sign, all by default
        #[arg(short, long)]
        signers: Option<usize>,

        /// Threshold, defaults to n - (n - 1) / 3
        #[arg(short, long)]
        threshold: Option<usize>,

        /// Gossip tick in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,

        /// Aggregate with the flat map instead of the tree
        #[arg(long)]
        flat: bool,

        /// Branching factor of the shutdown tree
        #[arg(short, long, default_value_t = 2)]
        branching: usize,

        /// Root sends the shutdown to every node directly
        #[arg(long, conflicts_with = "branching")]
        star: bool,

        /// Round deadline in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Print the roster public keys
    Roster,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.nodes == 0 {
        bail!("the roster needs at least one node");
    }

    match cli.command {
        Commands::Run {
            ref message,
            signers,
            threshold,
            tick_ms,
            flat,
            branching,
            star,
            timeout_ms,
        } => {
            let options = RoundOptions {
                message: message.as_bytes().to_vec(),
                signers: signers.unwrap_or(cli.nodes),
                threshold,
                tick: Duration::from_millis(tick_ms),
                tree_mode: !flat,
                branching: (!star).then_some(branching),
                timeout: Duration::from_millis(timeout_ms),
            };
            run_round(&cli, options).await?;
        }
        Commands::Roster => {
            show_roster(&cli)?;
        }
    }

    Ok(())
}

struct RoundOptions {
    message: Vec<u8>,
    signers: usize,
    threshold: Option<usize>,
    tick: Duration,
    tree_mode: bool,
    /// `None` for a star
    branching: Option<usize>,
    timeout: Duration,
}

fn generate_keys(cli: &Cli) -> Result<(Vec<Arc<KeyPair>>, Arc<Roster>)> {
    let mut rng = ChaCha20Rng::seed_from_u64(cli.seed);
    let keypairs: Vec<Arc<KeyPair>> = (0..cli.nodes)
        .map(|_| Arc::new(KeyPair::generate(&mut rng)))
        .collect();
    let publics: Vec<PublicKey> = keypairs.iter().map(|k| k.public()).collect();
    let roster = Roster::new(publics).context("building the roster")?;
    Ok((keypairs, Arc::new(roster)))
}

async fn run_round(cli: &Cli, options: RoundOptions) -> Result<()> {
    let (keypairs, roster) = generate_keys(cli)?;
    let tree = match options.branching {
        Some(branching) => Tree::new(cli.nodes, 0, branching)?,
        None => Tree::star(cli.nodes, 0)?,
    };
    let tree = Arc::new(tree);
    let network = Arc::new(MemoryNetwork::new());

    let mut params = Parameters::default_for(cli.nodes);
    params.gossip_tick = options.tick;
    params.tree_mode = options.tree_mode;
    if let Some(threshold) = options.threshold {
        params.threshold = threshold;
    }

    info!(
        nodes = cli.nodes,
        signers = options.signers,
        threshold = params.threshold,
        tree_mode = params.tree_mode,
        "Starting co-signing round"
    );

    let mut nodes = Vec::with_capacity(cli.nodes);
    for (index, keypair) in keypairs.iter().enumerate() {
        let ctx = NodeContext {
            index,
            keypair: keypair.clone(),
            roster: roster.clone(),
            tree: tree.clone(),
            transport: network.clone(),
        };
        let willing = index < options.signers;
        let verify: VerificationFn = Arc::new(move |_: &[u8], _: &[u8]| willing);

        let mut node = CosigProtocol::new(ctx, Some(verify))?;
        node.set_parameters(params.clone());
        node.set_timeout(options.timeout);
        node.set_seed(cli.seed.wrapping_add(index as u64));
        if tree.is_root(index) {
            node.set_message(options.message.clone());
        }

        let node = Arc::new(node);
        network.register(index, &node);
        nodes.push(node);
    }

    let root = nodes[tree.root()].clone();
    let final_signature = root
        .final_signature()
        .context("final signature already taken")?;

    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = node.clone();
            tokio::spawn(async move { (node.index(), node.dispatch().await) })
        })
        .collect();

    root.start()?;

    let signature = match final_signature.await {
        Ok(signature) => signature,
        Err(_) => {
            for handle in handles {
                if let (index, Err(e)) = handle.await? {
                    warn!(node = index, error = %e, "Node ended with an error");
                }
            }
            bail!("round ended without a collective signature");
        }
    };

    for handle in handles {
        if let (index, Err(e)) = handle.await? {
            warn!(node = index, error = %e, "Node ended with an error");
        }
    }

    signature.verify_aggregate_with_policy(
        &options.message,
        &roster,
        &ThresholdPolicy::new(params.threshold),
    )?;
    let mask = signature.mask(&roster)?;
    info!(
        signers = mask.count_enabled(),
        "Collective signature verified"
    );

    println!("Collective Signature: {}", hex::encode(signature.as_bytes()));
    println!("  Signers: {:?}", mask.enabled_indices().collect::<Vec<_>>());
    println!("  Messages: {}", network.envelopes().len());

    Ok(())
}

fn show_roster(cli: &Cli) -> Result<()> {
    let (_, roster) = generate_keys(cli)?;

    println!("Roster ({} nodes, seed {}):", roster.len(), cli.seed);
    for (index, public) in roster.publics().iter().enumerate() {
        println!("  {}: {}", index, public.to_hex()?);
    }

    Ok(())
}
