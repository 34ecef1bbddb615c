//! Periodic background work: window-start ticks and compliance sweeps.
//!
//! Each loop awaits its pass before waiting for the next tick, so passes of
//! the same loop never overlap. Missed ticks are delayed, not bunched up.
//! Both loops stop when the shared cancellation token fires.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::AttendanceEngine;

pub struct Watcher {
    engine: Arc<AttendanceEngine>,
    tick_every: Duration,
    sweep_every: Duration,
    cancel_token: CancellationToken,
}

/// Running watcher loops.
pub struct WatcherHandle {
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!("watcher task ended abnormally: {err}");
            }
        }
    }
}

impl Watcher {
    pub fn new(engine: Arc<AttendanceEngine>, tick_every: Duration, sweep_every: Duration) -> Self {
        Self {
            engine,
            tick_every,
            sweep_every,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop the loops when `token` is cancelled instead of an internal one.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn spawn(self) -> WatcherHandle {
        // Catch block starts from the tick just before we came up.
        let since = Utc::now()
            - chrono::Duration::from_std(self.tick_every).unwrap_or_else(|_| chrono::Duration::zero());

        let window_task = tokio::spawn(window_start_loop(
            self.engine.clone(),
            since,
            self.tick_every,
            self.cancel_token.clone(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(
            self.engine,
            self.sweep_every,
            self.cancel_token.clone(),
        ));
        info!(
            tick_secs = self.tick_every.as_secs_f64(),
            sweep_secs = self.sweep_every.as_secs_f64(),
            "watcher started"
        );

        WatcherHandle {
            cancel_token: self.cancel_token,
            tasks: vec![window_task, sweep_task],
        }
    }
}

async fn window_start_loop(
    engine: Arc<AttendanceEngine>,
    mut since: DateTime<Utc>,
    every: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                match engine.run_window_starts(since, now).await {
                    Ok(report) => {
                        debug!(windows = report.windows.len(), alerts = report.alerts.len(), "window tick");
                        // A failed block is retried on the next pass.
                        if report.failed.is_empty() {
                            since = now;
                        }
                    }
                    Err(err) => error!("window start pass failed: {err}"),
                }
            }
            _ = cancel_token.cancelled() => {
                info!("window start loop shutting down");
                break;
            }
        }
    }
}

async fn sweep_loop(engine: Arc<AttendanceEngine>, every: Duration, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run_sweep(Utc::now()) {
                    Ok(report) => debug!(no_shows = report.no_shows, reminders = report.reminders, "sweep"),
                    Err(err) => error!("compliance sweep failed: {err}"),
                }
            }
            _ = cancel_token.cancelled() => {
                info!("sweep loop shutting down");
                break;
            }
        }
    }
}
