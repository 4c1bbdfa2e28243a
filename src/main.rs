use clap::{Parser, Subcommand};
use mdcs_db::{DbError, StoreConfig};
use std::path::PathBuf;
use stress_test::{stress_test_kv, stress_test_scaling, StressConfig};
use tracing_subscriber::EnvFilter;

pub mod demo;

/// Merkle-DAG CRDT key-value store
#[derive(Parser)]
#[command(name = "mdcs")]
#[command(about = "Replicated key-value store over a Merkle-Clock: demo and stress harness")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Store configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG), e.g. "info" or "mdcs_db=debug"
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicas gossiping over the broadcast hub
    Demo {
        #[arg(long, default_value_t = 3)]
        replicas: usize,
    },
    /// One stress run with random writes and pairwise syncs
    Stress {
        #[arg(long, default_value_t = 4)]
        replicas: usize,
        #[arg(long, default_value_t = 100)]
        ops: usize,
        #[arg(long, default_value_t = 200)]
        syncs: usize,
        #[arg(long, default_value_t = 32)]
        keys: usize,
        #[arg(long, default_value_t = 0.2)]
        delete_ratio: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Stress runs with a growing number of replicas
    Scaling {
        #[arg(long, default_value_t = 20)]
        max_replicas: usize,
        #[arg(long, default_value_t = 2)]
        step: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<(), DbError> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let store = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };

    match cli.command {
        Some(Commands::Demo { replicas }) => demo::live_demo(replicas, &store).await?,
        Some(Commands::Stress {
            replicas,
            ops,
            syncs,
            keys,
            delete_ratio,
            seed,
        }) => {
            let stats = stress_test_kv(StressConfig {
                num_replicas: replicas,
                ops_per_replica: ops,
                num_syncs: syncs,
                num_keys: keys,
                delete_ratio,
                seed,
                store,
            })
            .await?;
            stats.print();
        }
        Some(Commands::Scaling {
            max_replicas,
            step,
            seed,
        }) => {
            let base = StressConfig {
                seed,
                store,
                ..Default::default()
            };
            stress_test_scaling(base, max_replicas, step).await?;
        }
        None => run_suite(store).await?,
    }
    Ok(())
}

async fn run_suite(store: StoreConfig) -> Result<(), DbError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Small scale, then medium scale
    for (replicas, ops, syncs) in [(4, 100, 200), (10, 500, 1000)] {
        let stats = stress_test_kv(StressConfig {
            num_replicas: replicas,
            ops_per_replica: ops,
            num_syncs: syncs,
            store: store.clone(),
            ..Default::default()
        })
        .await?;
        stats.print();
    }

    demo::live_demo(3, &store).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
