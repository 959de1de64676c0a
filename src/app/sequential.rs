use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use minimr::cmd::sequential::Args;
use minimr::{sequential, workload};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let engine = workload::named(&args.workload)?;
    let aux = Bytes::from(serde_json::to_vec(&args.args)?);
    sequential::run(&engine, aux, &args.inputs, &args.output_dir)
}
