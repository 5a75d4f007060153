use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "taubench",
    about = "Interactive workbench for the Tau REPL",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the tau executable (overrides the config file)
    #[arg(long, global = true)]
    pub tau_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an interactive session against the REPL
    Run {
        /// Per-command timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Remember the resolved executable in .taubench/config.toml
        #[arg(long)]
        save_path: bool,
    },

    /// Step through a script file, one statement per line
    Script {
        /// Script file to execute
        path: PathBuf,

        /// Per-line timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Append the transaction log as JSON lines to this file
        #[arg(long)]
        log_out: Option<PathBuf>,
    },

    /// Show the resolved project configuration
    Config,
}
