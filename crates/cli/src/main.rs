mod cli;
mod install;
mod run;
mod service;

use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Install(args) => install::install(args).await,
        Command::Run(args) => run::run(args).await,
        Command::Service(args) => service::service(&args),
    }
}
