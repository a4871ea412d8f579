use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fluxrun",
    version,
    about = "Compute runner daemon for the flux control plane"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive runner setup and registration
    Install(InstallArgs),
    /// Run the runner daemon
    Run(RunArgs),
    /// Manage the daemon process
    Service(ServiceArgs),
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Accept the default for every setting without prompting
    #[arg(long)]
    pub use_defaults: bool,

    /// Print a context description for each setting
    #[arg(short, long)]
    pub descriptions: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the config file (defaults to the one recorded at install)
    #[arg(short = 'c', long, env = "FLUXRUN_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ServiceArgs {
    #[command(subcommand)]
    pub action: ServiceAction,
}

#[derive(Debug, Subcommand)]
pub enum ServiceAction {
    /// Start the daemon detached from this terminal
    Start {
        /// Extra arguments forwarded to `fluxrun run`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop the running daemon
    Stop,
    /// Report the daemon's PID, CPU and memory usage
    Status,
}
