use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use studytrack_core::MonitoringAggregator;

use super::{open_store, print_json, CmdResult};

pub fn run(db: Option<&Path>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> CmdResult {
    let config = studytrack_core::Config::load()?;
    let store = open_store(db, &config)?;
    let now = Utc::now();
    let from = from.unwrap_or(now - Duration::hours(12));
    let to = to.unwrap_or(now + Duration::hours(12));

    let aggregator = MonitoringAggregator::with_chunk_size(store, config.monitor.chunk_size);
    print_json(&aggregator.query_cohort_status(from, to, now)?)
}
