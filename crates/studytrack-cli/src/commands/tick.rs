//! One-shot runs of the periodic work.

use std::path::Path;

use chrono::{Duration, Utc};

use super::{open_engine, print_json, CmdResult};

pub async fn run_tick(db: Option<&Path>, since_minutes: i64) -> CmdResult {
    let (_config, engine) = open_engine(db)?;
    let now = Utc::now();
    let mut report = engine
        .run_window_starts(now - Duration::minutes(since_minutes.max(0)), now)
        .await?;
    if let Some(delivery) = report.delivery.take() {
        delivery.await?;
    }
    print_json(&report)
}

pub async fn run_sweep(db: Option<&Path>) -> CmdResult {
    let (_config, engine) = open_engine(db)?;
    let mut report = engine.run_sweep(Utc::now())?;
    if let Some(delivery) = report.delivery.take() {
        delivery.await?;
    }
    print_json(&report)
}
