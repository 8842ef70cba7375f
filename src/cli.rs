use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kyverno-plugin")]
#[command(about = "Kyverno plugin for Policy Reporter")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check {
        /// Path to the YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run the policy API server and, if enabled, the block report pipeline
    Run {
        /// Path to the YAML config file (defaults to ./config.yaml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// HTTP port, overrides server.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Lease name, overrides leaderElection.lockName
        #[arg(long, env = "LEADER_ELECTION_LOCK_NAME")]
        lease_name: Option<String>,
    },
}
