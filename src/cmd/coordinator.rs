use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Input files, one map task each. May be empty.
    pub inputs: Vec<PathBuf>,

    /// Reduce fan-out: the number of reduce tasks and output files
    #[arg(short = 'r', long, default_value_t = 10)]
    pub n_reduce: u32,

    /// Seconds a worker may hold a task before its lease is reclaimed
    #[arg(short = 't', long, default_value_t = 10)]
    pub lease_secs: u64,

    /// Directory where workers stage intermediate files
    #[arg(long, default_value = "/var/tmp")]
    pub scratch_dir: PathBuf,

    /// Directory receiving committed output files
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Override the coordinator socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,
}
