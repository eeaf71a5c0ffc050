//! Strand simulation binary.
//!
//! Runs a random workload through the routing stack against an in-process
//! cluster of in-memory primaries:
//!
//! ```bash
//! strand-sim --shards 4 --keys 1000 --ops 5000
//! ```
//!
//! With `--fault`, one server drops out mid-run and comes back through the
//! auto-reconnector:
//!
//! ```bash
//! strand-sim --shards 3 --tickets 8 --fault --log-level debug
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use clap::Parser;
use strand_core::{ClientId, ServerId};
use strand_flow::Interruptor;
use strand_routing::ReadinessLevel;
use strand_runtime::RuntimeConfig;
use strand_sim::scenarios::{even_partition, sharded_primaries};
use strand_sim::{check_single_primary, ClientNode, SimCluster, Workload, WorkloadConfig};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Server the client node runs on.
const LOCAL_SERVER: u64 = 1_000;

/// Strand routing simulation.
#[derive(Parser, Debug)]
#[command(name = "strand-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards, one primary each.
    #[arg(long, default_value = "4")]
    shards: usize,

    /// Number of distinct keys.
    #[arg(long, default_value = "1000")]
    keys: usize,

    /// Number of operations to run.
    #[arg(long, default_value = "5000")]
    ops: usize,

    /// Fraction of operations that are writes.
    #[arg(long, default_value = "0.5")]
    write_ratio: f64,

    /// Tickets granted per client by every primary. Unlimited if unset.
    #[arg(long)]
    tickets: Option<u64>,

    /// Drop one server mid-run and let it reconnect.
    #[arg(long)]
    fault: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.shards == 0 {
        return Err("--shards must be > 0".into());
    }
    let config = RuntimeConfig::new(ServerId::new(LOCAL_SERVER));
    config.validate()?;

    info!(
        shards = args.shards,
        keys = args.keys,
        ops = args.ops,
        tickets = ?args.tickets,
        fault = args.fault,
        "Starting strand simulation"
    );

    let cluster = SimCluster::new();
    let regions = even_partition(args.shards, args.keys);
    let replicas = sharded_primaries(&cluster, &regions, 1, args.tickets)?;
    let node = ClientNode::start(&cluster, &config, ClientId::new(1));

    tokio::time::timeout(
        Duration::from_secs(10),
        node.dispatcher()
            .check_readiness(ReadinessLevel::Writes, &Interruptor::never()),
    )
    .await??;
    info!(regions = regions.len(), "Cluster ready");

    let workload = Workload::generate(
        &WorkloadConfig {
            keys: args.keys,
            operations: args.ops,
            write_ratio: args.write_ratio,
        },
        &mut rand::thread_rng(),
    );

    let fault = args.fault.then(|| {
        let cluster = std::sync::Arc::clone(&cluster);
        let (server, _) = replicas[replicas.len() / 2].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            warn!(server = %server, "Injecting fault: dropping server");
            cluster.set_reachable(server, false);
            cluster.disconnect(server);
            tokio::time::sleep(Duration::from_millis(500)).await;
            info!(server = %server, "Server reachable again");
            cluster.set_reachable(server, true);
        })
    });

    let report = workload
        .run(node.dispatcher(), &Interruptor::never())
        .await;
    if let Some(fault) = fault {
        fault.await?;
    }

    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        indeterminate = report.indeterminate,
        mismatches = report.mismatches,
        "Workload finished"
    );
    for (server, replica) in &replicas {
        info!(
            server = %server,
            region = %replica.region(),
            keys = replica.data().len(),
            requests = replica.observed().len(),
            "Replica summary"
        );
    }
    check_single_primary(node.dispatcher().registry())?;

    node.shutdown().await;

    if report.mismatches > 0 {
        return Err(format!("{} reads disagreed with the reference model", report.mismatches).into());
    }
    Ok(())
}
