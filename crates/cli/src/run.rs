//! The `run` subcommand: boot the daemon and hand control to the job
//! manager.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fluxrun_core::config::RunnerConfig;
use fluxrun_core::files::{self, FileManager};
use fluxrun_core::logging;
use fluxrun_engine::{JobManager, ServerProxy};

use crate::cli::RunArgs;

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config_path = args
        .config
        .or_else(files::read_default_config_path)
        .context("no configuration file found; run `fluxrun install` or pass -c <path>")?;

    let config = RunnerConfig::load(&config_path)
        .with_context(|| format!("load configuration {}", config_path.display()))?;

    let file_manager = Arc::new(FileManager::new(&config.file_manager));
    file_manager
        .init_directories()
        .context("create runner directories")?;
    logging::init_logging(file_manager.log_dir(), &config.logging).context("set up logging")?;

    // From here on failures are visible in the log file as well.
    match boot(config, file_manager).await {
        Ok(()) => {
            info!("runner terminating");
            Ok(())
        }
        Err(err) => {
            error!("fatal error encountered on startup: {err:#}");
            Err(err)
        }
    }
}

async fn boot(config: RunnerConfig, file_manager: Arc<FileManager>) -> anyhow::Result<()> {
    let proxy = Arc::new(
        ServerProxy::connect(&config.server_proxy)
            .await
            .context("cannot reach the control plane")?,
    );

    let stop = CancellationToken::new();
    let interrupt_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, requesting stop");
            interrupt_stop.cancel();
        }
    });

    let mut manager = JobManager::new(
        proxy.clone(),
        file_manager,
        config.job_manager.clone(),
        stop,
    )
    .await
    .map_err(|err| anyhow::anyhow!("install observers: {err}"))?;

    info!("initialisation complete, handing control to the job manager");
    manager.run().await;

    proxy.report_offline().await;
    proxy.shutdown();
    Ok(())
}
