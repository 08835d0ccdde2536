pub mod events;
pub mod supervisor;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::plugins::KindFactory;
use supervisor::Supervisor;

/// Serve the configured device plugin until a terminate signal arrives.
#[tokio::main]
pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    info!("Starting {:?} device plugin", config.device);

    let (tx, rx) = mpsc::unbounded_channel();
    info!("Starting FS watcher on {:?}.", config.plugin_dir);
    let _watcher = events::watch_plugin_dir(&config.plugin_dir, tx.clone())
        .context("failed to create FS watcher")?;
    info!("Starting OS watcher.");
    let _signals = events::forward_signals(tx).context("failed to install signal handlers")?;

    let supervisor = Supervisor::new(&config, KindFactory::new(config.clone()));
    let res = supervisor.run(rx).await;
    info!("Stopped");
    res
}
