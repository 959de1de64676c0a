use anyhow::Result;
use clap::Parser;
use minimr::cmd::coordinator::Args;
use minimr::coordinator::CoordinatorService;
use minimr::utils;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let socket = args.socket.unwrap_or_else(utils::coordinator_socket);

    let service = CoordinatorService::new(
        args.inputs,
        args.n_reduce,
        Duration::from_secs(args.lease_secs),
        args.scratch_dir,
        args.output_dir,
    )?;
    service.serve(socket).await
}
