//! ShardSync - Write Replication for Shard-Partitioned Storage
//!
//! Command line tool to manage the configuration and to run replicated
//! writes against an in-memory shard group.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardsync::config::{LoggingConfig, ShardSyncConfig};
use shardsync::error::{Error, Result};
use shardsync::memory::{LocalPrimary, LocalReplicas, WriteRequest};
use shardsync::replication::{Primary, ReplicationOperation, ShardInfo};
use shardsync::shard::{AllocationId, IndexShardRoutingTable, SeqNo, ShardId, ShardRouting};

/// ShardSync - Write Replication for Shard-Partitioned Storage
#[derive(Parser)]
#[command(name = "shardsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardsync.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Replicate writes through an in-memory shard group
    Simulate {
        /// Number of writes (defaults to simulation.writes)
        #[arg(short, long)]
        writes: Option<usize>,

        /// Number of started replicas (defaults to simulation.replicas)
        #[arg(short, long)]
        replicas: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = logging_config(&cli.config);
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format);

    match cli.command {
        Commands::Init { output } => {
            run_init(output)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Simulate { writes, replicas } => {
            run_simulate(cli.config, writes, replicas).await
        }
    }
}

/// Logging section of the config file, or defaults if it cannot be read
fn logging_config(path: &std::path::Path) -> LoggingConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<ShardSyncConfig>(&content).ok())
        .map(|config| config.logging)
        .unwrap_or_default()
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists, refusing to overwrite",
            output.display()
        )));
    }

    let config_content = r#"# ShardSync Configuration
# Generated configuration file

[replication]
retry_initial_backoff_ms = 50
retry_timeout_ms = 60000
# "none", "all" or a number of copies
wait_for_active_shards = "1"
# Respect per-copy replication mode hints
mode_aware = false
# replication_mode_override = "primary_term_validation"

[logging]
level = "info"
format = "pretty"

[simulation]
replicas = 2
writes = 10
unassigned_replicas = 0
flaky_replicas = 0
flaky_attempts = 2
failing_replicas = 0
max_latency_ms = 5
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then run: shardsync --config {} simulate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ShardSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Retry Backoff:  {:?}", config.retry_initial_backoff());
            println!("  Retry Timeout:  {:?}", config.retry_timeout());
            println!("  Active Shards:  {}", config.replication.wait_for_active_shards);
            println!("  Policy:         {:?}", config.replication_proxy());
            println!("  Log Level:      {}", config.logging.level);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

#[derive(Serialize)]
struct WriteReport<'a> {
    id: String,
    seq_no: Option<SeqNo>,
    #[serde(rename = "_shards")]
    shards: &'a ShardInfo,
}

#[derive(Serialize)]
struct CheckpointReport {
    allocation_id: AllocationId,
    local_checkpoint: Option<SeqNo>,
    global_checkpoint: Option<SeqNo>,
}

/// Run writes through an in-memory shard group
async fn run_simulate(config_path: PathBuf, writes: Option<usize>, replicas: Option<usize>) -> Result<()> {
    let mut config = if config_path.exists() {
        ShardSyncConfig::from_file(&config_path)?
    } else {
        tracing::info!("No configuration at {:?}, using defaults", config_path);
        ShardSyncConfig::default()
    };
    if let Some(writes) = writes {
        config.simulation.writes = writes;
    }
    if let Some(replicas) = replicas {
        config.simulation.replicas = replicas;
    }
    config.validate()?;

    let sim = &config.simulation;
    let shard_id = ShardId::new("sim", 0);
    let mut shards = vec![ShardRouting::started(shard_id.clone(), "node-0", true)];
    let mut replica_ids = Vec::with_capacity(sim.replicas);
    for n in 1..=sim.replicas {
        let routing = ShardRouting::started(shard_id.clone(), format!("node-{}", n), false);
        replica_ids.extend(routing.allocation_id.clone());
        shards.push(routing);
    }
    shards.extend((0..sim.unassigned_replicas).map(|_| ShardRouting::unassigned(shard_id.clone(), false)));

    let primary_term = 1;
    let primary = Arc::new(LocalPrimary::new(
        IndexShardRoutingTable::new(shard_id.clone(), shards),
        primary_term,
    )?);
    let replicas = Arc::new(LocalReplicas::new().with_max_latency(config.max_latency()));

    let (flaky, rest) = replica_ids.split_at(sim.flaky_replicas);
    for id in flaky {
        replicas.fail_next(id, sim.flaky_attempts, || {
            Error::CircuitBreaking("simulated memory pressure".into())
        });
    }
    for id in rest.iter().take(sim.failing_replicas) {
        replicas.fail_always(id, || Error::InvalidRequest("simulated mapping conflict".into()));
    }

    tracing::info!(
        "Simulating {} writes to {} with {} replicas ({} unassigned)",
        sim.writes,
        shard_id,
        sim.replicas,
        sim.unassigned_replicas
    );

    let operations = (0..sim.writes).map(|n| {
        let id = format!("doc-{}", n);
        let request = WriteRequest::index(shard_id.clone(), id.clone(), format!(r#"{{"n":{}}}"#, n))
            .wait_for_active_shards(config.replication.wait_for_active_shards);
        let operation = ReplicationOperation::new(request, Arc::clone(&primary), Arc::clone(&replicas), primary_term)
            .with_proxy(config.replication_proxy())
            .with_config(config.replication_config())
            .with_op_type("index");
        async move { (id, operation.execute().await) }
    });

    let mut failed = 0;
    for (id, outcome) in futures::future::join_all(operations).await {
        match outcome {
            Ok(result) => {
                let shards = result.shard_info().cloned().unwrap_or_default();
                let report = WriteReport { id, seq_no: result.seq_no(), shards: &shards };
                println!("{}", serde_json::to_string(&report)?);
            }
            Err(e) => {
                failed += 1;
                tracing::error!("Write {} failed: {}", id, e);
            }
        }
    }

    let mut checkpoints = Vec::with_capacity(replica_ids.len() + 1);
    if let Some(allocation_id) = primary.routing_entry().allocation_id {
        checkpoints.push(CheckpointReport {
            allocation_id,
            local_checkpoint: Some(primary.local_checkpoint()),
            global_checkpoint: Some(primary.global_checkpoint()),
        });
    }
    for id in &replica_ids {
        checkpoints.push(CheckpointReport {
            allocation_id: id.clone(),
            local_checkpoint: replicas.local_checkpoint(id),
            global_checkpoint: replicas.global_checkpoint(id),
        });
    }
    println!("{}", serde_json::to_string_pretty(&checkpoints)?);

    if failed > 0 {
        tracing::warn!("{} of {} writes failed", failed, sim.writes);
    }
    Ok(())
}
