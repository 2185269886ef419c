/*
    Runs a small chained-bft cluster in one process. Each view a new
    proposer gathers NEW_VIEW messages, proposes a block and collects votes;
    a block commits once three certified blocks are chained on top of it.

    Usage: chained-bft [validators] [views]
    Log level is taken from RUST_LOG (default: info).
*/

use chained_bft::cluster::{LocalCluster, START_VIEW};
use chained_bft::SmrConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let size = args.next().and_then(|a| a.parse().ok()).unwrap_or(4usize);
    let views = args.next().and_then(|a| a.parse().ok()).unwrap_or(10i64);

    let cluster = match LocalCluster::new(size, SmrConfig::default()) {
        Ok(cluster) => cluster,
        Err(err) => {
            error!(%err, "failed to build cluster");
            std::process::exit(1);
        }
    };
    cluster.start();

    for view in START_VIEW..START_VIEW + views {
        match cluster.run_view(view).await {
            Ok(block) => info!(view, block = %hex::encode(&block.id[..8]), "view finished"),
            Err(err) => {
                error!(view, %err, "view failed");
                break;
            }
        }
    }

    for node in &cluster.nodes {
        info!(
            node = %node.address,
            confirmed_height = node.ledger.confirmed_height(),
            "final state"
        );
    }
    cluster.stop().await;
}
