use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use machinewatch::config::{Config, LoggingConfig, TransportKind};
use machinewatch::detect::{IsolationForest, PersistedModel};
use machinewatch::simulator::Simulator;
use machinewatch::telemetry::FeatureExtractor;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "machinewatch",
    about = "Streaming anomaly detection for industrial sensor telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine (ingest + alerting + query API)
    Run {
        /// Also run the telemetry simulator in-process
        #[arg(long)]
        simulate: bool,

        /// Query API bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Generate synthetic telemetry only
    Simulate {
        /// Number of virtual machines (overrides config)
        #[arg(long)]
        machines: Option<usize>,

        /// Milliseconds between ticks (overrides config)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,

        /// Random seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Describe a persisted model file
    InspectModel {
        /// Path to a `<machine>.model.json` file
        path: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Resolve the configuration under a plain stderr subscriber, so fallback
/// warnings are visible before the configured one is installed.
fn load_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::load_or_default(explicit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { simulate, bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, simulate, "Starting machinewatch");
            machinewatch::run(config, simulate).await?;
        }
        Commands::Simulate {
            machines,
            interval_ms,
            ticks,
            seed,
        } => {
            if let Some(machines) = machines {
                config.simulator.machines = machines;
            }
            if let Some(interval_ms) = interval_ms {
                config.simulator.interval_ms = interval_ms;
            }
            if seed.is_some() {
                config.simulator.seed = seed;
            }
            simulate(&config, ticks).await?;
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{}", text);
        }
        Commands::InspectModel { path, json } => {
            inspect_model(&config, &path, json)?;
        }
    }

    Ok(())
}

/// Publish simulated readings to the configured broker. With the in-process
/// transport there is nobody to receive them, so print JSON lines instead.
async fn simulate(config: &Config, ticks: Option<u64>) -> Result<()> {
    let channel = match config.transport.kind {
        TransportKind::Memory => None,
        TransportKind::Nats => Some(machinewatch::connect(config).await?),
    };
    let namespace = &config.transport.namespace;
    let interval = Duration::from_millis(config.simulator.interval_ms);
    let mut simulator = Simulator::from_config(&config.simulator);

    tracing::info!(
        machines = config.simulator.machines,
        ?interval,
        ?ticks,
        publish = channel.is_some(),
        "Starting telemetry simulator"
    );

    let mut tick: u64 = 0;
    loop {
        match &channel {
            Some(channel) => {
                simulator.publish_tick(channel.as_ref(), namespace).await?;
            }
            None => {
                for reading in simulator.tick(chrono::Utc::now()) {
                    println!("{}", serde_json::to_string(&reading)?);
                }
            }
        }
        tick += 1;
        if ticks.is_some_and(|max| tick >= max) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    tracing::info!(ticks = tick, "Simulator stopped");
    Ok(())
}

fn inspect_model(config: &Config, path: &std::path::Path, json: bool) -> Result<()> {
    let persisted = PersistedModel::read(path)
        .with_context(|| format!("failed to read model file: {}", path.display()))?;
    let extractor = FeatureExtractor::new(config.model.features.clone())?;
    let machine_id = persisted.machine_id.clone();
    let layout = persisted.layout.clone();
    let training_samples = persisted.training_samples;
    let trained_at = persisted.trained_at;
    let params = persisted.forest.params().clone();
    let sample_size = persisted.forest.sample_size();
    let threshold = persisted.forest.threshold();
    let compatibility = IsolationForest::deserialize(persisted, &extractor).map(|_| ());

    if json {
        let report = serde_json::json!({
            "machine_id": machine_id,
            "layout": layout,
            "training_samples": training_samples,
            "trained_at": trained_at,
            "params": params,
            "sample_size": sample_size,
            "decision_threshold": threshold,
            "compatible": compatibility.is_ok(),
            "incompatibility": compatibility.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let names: Vec<&str> = layout.iter().map(|s| s.name()).collect();
    println!("\nmachinewatch model: {}", path.display());
    println!("{:<20} : {}", "Machine", machine_id);
    println!("{:<20} : {}", "Features", names.join(", "));
    println!("{:<20} : {}", "Training samples", training_samples);
    println!("{:<20} : {}", "Trained at", trained_at.to_rfc3339());
    println!("{:<20} : {}", "Trees", params.n_estimators);
    match sample_size {
        Some(n) => println!("{:<20} : {}", "Sub-sample size", n),
        None => println!("{:<20} : -", "Sub-sample size"),
    }
    match threshold {
        Some(t) => println!(
            "{:<20} : {:.4} (contamination {})",
            "Decision threshold", t, params.contamination
        ),
        None => println!("{:<20} : -", "Decision threshold"),
    }
    match compatibility {
        Ok(()) => println!("{:<20} : yes", "Loadable"),
        Err(e) => println!("{:<20} : no ({})", "Loadable", e),
    }
    println!();
    Ok(())
}
