//! CLI argument parsing for nonstop.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use nonstop_slurm::JobId;

#[derive(Parser, Debug)]
#[command(name = "nonstop")]
#[command(about = "Fault-tolerant job manipulation service for SLURM")]
pub struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = "/etc/slurm/nonstop.conf")]
    pub config: Utf8PathBuf,

    /// Shared key used to seal requests
    #[arg(long, global = true, default_value = "/etc/slurm/nonstop.key")]
    pub auth_key: Utf8PathBuf,

    /// Print replies as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the daemon
    Serve {
        /// Directory holding the saved failure registry
        #[arg(long, default_value = "/var/spool/slurm/nonstop")]
        state_dir: Utf8PathBuf,

        /// Start with an empty registry if the saved state is unreadable
        #[arg(long)]
        ignore_state_errors: bool,

        /// Scheduler poll interval in seconds
        #[arg(long, default_value = "5")]
        poll_interval: u64,
    },

    /// Show the daemon's active configuration
    ShowConfig,

    /// Show a job's failure record
    ShowJob { job_id: JobId },

    /// List a job's failed and failing nodes
    FailNodes {
        job_id: JobId,

        /// 1 = failing, 2 = failed, 3 = both
        #[arg(long, default_value = "3")]
        state_flags: u32,
    },

    /// Remove a failed node from a job's allocation
    DropNode { job_id: JobId, node: String },

    /// Replace a failed node in a job's allocation
    ReplaceNode { job_id: JobId, node: String },

    /// Extend a job's time limit from its earned credit (0 = all of it)
    TimeIncr {
        job_id: JobId,
        #[arg(default_value = "0")]
        minutes: u32,
    },

    /// Mark nodes as failing
    Drain {
        /// Hostlist expression, e.g. nid[10-12]
        nodes: String,

        #[arg(long)]
        reason: String,
    },

    /// Subscribe to a job's events and print them as they arrive
    Callback {
        job_id: JobId,

        /// Local port to listen on (0 picks one)
        #[arg(long, default_value = "0")]
        port: u16,
    },
}
