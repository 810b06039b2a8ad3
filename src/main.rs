use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forksim::config::SimConfig;
use forksim::core::params::format_amount;
use forksim::sim::{SimError, Simulation};
use forksim::storage::Storage;

/// Simulated time between status lines
const STATUS_INTERVAL_MS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "forksim", version)]
#[command(about = "ForkSim - watch a proof-of-work network fork, reorganize and converge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated network
    Run {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        nodes: Option<usize>,
        /// How many nodes mine (default: all)
        #[arg(short, long)]
        miners: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Simulated seconds to run
        #[arg(short, long, default_value_t = 60)]
        duration_secs: u64,
        /// Pace ticks against the wall clock instead of running flat out
        #[arg(long)]
        realtime: bool,
        /// Resume from a saved network in this directory
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Save the network to this directory when done
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Show a saved network
    Inspect {
        #[arg(long)]
        data_dir: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the default config as JSON
    DefaultConfig,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forksim=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config, nodes, miners, seed, duration_secs, realtime, resume, save } => {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                println!("\n🛑 Stopping simulation...");
                stop_clone.store(true, Ordering::SeqCst);
            }) {
                tracing::warn!("Ctrl-C handler not installed: {}", e);
            }

            let opts = RunOptions { config, nodes, miners, seed, duration_secs, realtime, resume, save };
            run(opts, stop)
        }

        Commands::Inspect { data_dir, json } => inspect(&data_dir, json),

        Commands::DefaultConfig => {
            println!("{}", SimConfig::default().to_json_pretty());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

struct RunOptions {
    config: Option<PathBuf>,
    nodes: Option<usize>,
    miners: Option<usize>,
    seed: Option<u64>,
    duration_secs: u64,
    realtime: bool,
    resume: Option<PathBuf>,
    save: Option<PathBuf>,
}

fn build_simulation(opts: &RunOptions) -> Result<Simulation, SimError> {
    if let Some(dir) = &opts.resume {
        let storage = Storage::open(dir)?;
        return Simulation::load(&storage);
    }
    let mut config = match &opts.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(n) = opts.nodes {
        config.nodes = n;
    }
    if let Some(m) = opts.miners {
        config.miners = Some(m);
    }
    if let Some(s) = opts.seed {
        config.seed = s;
    }
    Simulation::new(config)
}

fn run(opts: RunOptions, stop: Arc<AtomicBool>) -> Result<(), SimError> {
    let mut sim = build_simulation(&opts)?;
    let config = sim.config();
    println!("🚀 ForkSim v{}", env!("CARGO_PKG_VERSION"));
    println!("  Nodes:    {} ({} mining)", sim.node_ids().len(), sim.nodes().filter(|n| n.is_mining()).count());
    println!("  Seed:     {}", config.seed);
    println!("  Tick:     {}ms", config.tick_ms);
    println!("  Latency:  {}-{}ms", config.min_latency_ms, config.max_latency_ms);
    println!("  Verifier: {:?}", config.verifier);
    println!("  Duration: {}s simulated{}", opts.duration_secs, if opts.realtime { " (realtime)" } else { "" });

    let until = sim.now() + opts.duration_secs * 1000;
    if opts.realtime {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(run_realtime(&mut sim, until, stop));
    } else {
        run_flat_out(&mut sim, until, &stop);
    }

    println!("\n📊 Final state");
    print!("{}", sim.summary());

    if let Some(dir) = &opts.save {
        let storage = Storage::open(dir)?;
        sim.save(&storage)?;
        println!("\n💾 Saved to {}", dir.display());
    }
    Ok(())
}

fn run_flat_out(sim: &mut Simulation, until: u64, stop: &AtomicBool) {
    let mut next_status = sim.now() + STATUS_INTERVAL_MS;
    while sim.now() < until && !stop.load(Ordering::Relaxed) {
        sim.tick();
        if sim.now() >= next_status {
            next_status += STATUS_INTERVAL_MS;
            log_status(sim);
        }
    }
}

async fn run_realtime(sim: &mut Simulation, until: u64, stop: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(sim.config().tick_ms));
    let mut next_status = sim.now() + STATUS_INTERVAL_MS;
    while sim.now() < until {
        interval.tick().await;
        if stop.load(Ordering::Relaxed) {
            break;
        }
        sim.tick();
        if sim.now() >= next_status {
            next_status += STATUS_INTERVAL_MS;
            log_status(sim);
        }
    }
}

fn log_status(sim: &Simulation) {
    let heights: Vec<i64> = sim.nodes().map(|n| n.height()).collect();
    let best = heights.iter().copied().max().unwrap_or(-1);
    let stats = sim.stats();
    tracing::info!(
        "📊 t={}s best=#{} heights={:?} mined={} in-flight={} converged={}",
        sim.now() / 1000,
        best,
        heights,
        stats.blocks_mined,
        sim.pending_deliveries(),
        sim.converged()
    );
}

fn inspect(data_dir: &Path, json: bool) -> Result<(), SimError> {
    let storage = Storage::open(data_dir)?;
    let sim = Simulation::load(&storage)?;
    let summary = sim.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary).expect("summary serialization failed"));
        return Ok(());
    }
    println!("📂 {} ({} consensus versions)", data_dir.display(), sim.registry().len());
    print!("{}", summary);
    for node in sim.nodes() {
        let notes: Vec<&String> = node
            .chain()
            .selected_chain()
            .into_iter()
            .flat_map(|id| node.block_log(&node.chain().block(id).hash).iter())
            .collect();
        if !notes.is_empty() {
            println!("  node {} milestones:", node.id());
            for note in notes {
                println!("    {}", note);
            }
        }
        if let Some(wallet) = sim.wallet(node.id()) {
            let balances = node.balances();
            println!("  node {} wallet {}: {}", node.id(), wallet.address(), format_amount(wallet.balance(&balances)));
        }
    }
    Ok(())
}
