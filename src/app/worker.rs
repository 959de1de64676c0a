use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use minimr::cmd::worker::Args;
use minimr::worker::{self, Worker, DEFAULT_POLL_INTERVAL};
use minimr::{utils, workload};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Attempts to reach a coordinator that may not have bound its socket yet.
const CONNECT_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let engine = workload::named(&args.workload)?;
    let aux = Bytes::from(serde_json::to_vec(&args.args)?);
    let socket = args.socket.unwrap_or_else(utils::coordinator_socket);

    let mut attempt = 0;
    let client = loop {
        match worker::connect(&socket).await {
            Ok(client) => break client,
            Err(err) => {
                attempt += 1;
                if attempt >= CONNECT_ATTEMPTS {
                    return Err(err);
                }
                warn!(?err, "coordinator not reachable yet; retrying");
                sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let mut worker = Worker::new(
        client,
        engine,
        aux,
        args.scratch_dir,
        args.shard_dir,
        DEFAULT_POLL_INTERVAL,
    );
    worker.run().await
}
