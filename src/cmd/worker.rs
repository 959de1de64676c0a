use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Name of the workload to run (e.g. `wc`, `grep`)
    #[arg(short, long)]
    pub workload: String,

    /// Directory where staged intermediate files are written
    #[arg(long, default_value = "/var/tmp")]
    pub scratch_dir: PathBuf,

    /// Directory holding committed intermediate shards
    #[arg(short, long, default_value = ".")]
    pub shard_dir: PathBuf,

    /// Override the coordinator socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Vec<String>,
}
