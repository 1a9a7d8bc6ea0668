use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "station-aggregator")]
#[command(about = "Running per-station temperature aggregates joined with station metadata")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Pipeline configuration file (TOML)")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay station registrations and readings through the pipeline
    Run {
        #[arg(short, long, help = "Station registrations CSV (station_id,name)")]
        stations: Option<PathBuf>,

        #[arg(short, long, help = "Readings CSV (station_id,payload)")]
        readings: PathBuf,

        #[arg(long, default_value = "false", help = "Input CSV files have no header row")]
        no_headers: bool,

        #[arg(short, long, help = "Write emitted aggregates as JSON lines [default: stdout]")]
        output_file: Option<PathBuf>,

        #[arg(long, help = "State directory [default: from configuration]")]
        state_dir: Option<PathBuf>,

        #[arg(long, default_value = "false", help = "Keep state in memory only")]
        in_memory: bool,

        #[arg(short, long, help = "Partition count [default: number of CPUs]")]
        partitions: Option<usize>,

        #[arg(long, help = "Consumer group id")]
        group_id: Option<String>,
    },

    /// Show aggregates stored in a state directory
    Inspect {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(short, long)]
        station_id: Option<u32>,
    },
}
