//! Long-running mode: window-start ticks and sweeps until Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use studytrack_core::Watcher;
use tracing::info;

use super::{open_engine, CmdResult};

pub async fn run(db: Option<&Path>) -> CmdResult {
    let (config, engine) = open_engine(db)?;
    let handle = Watcher::new(
        Arc::new(engine),
        Duration::from_secs(config.watcher.tick_seconds),
        Duration::from_secs(config.watcher.sweep_seconds),
    )
    .spawn();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping watcher");
    handle.shutdown().await;
    Ok(())
}
