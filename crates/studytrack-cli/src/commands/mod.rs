pub mod block;
pub mod config;
pub mod presence;
pub mod roster;
pub mod status;
pub mod tick;
pub mod watch;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use studytrack_core::{AttendanceEngine, Config, LoggingGateway, SqliteStore};

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Open the store from `--db`, else from the configured path.
pub fn open_store(db: Option<&Path>, config: &Config) -> Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    let path = match db {
        Some(path) => path.to_path_buf(),
        None => config.database_path()?,
    };
    Ok(Arc::new(SqliteStore::open(&path)?))
}

/// Engine over the local store, delivering notifications to the log.
pub fn open_engine(db: Option<&Path>) -> Result<(Config, AttendanceEngine), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let store = open_store(db, &config)?;
    let engine = AttendanceEngine::from_config(store, Arc::new(LoggingGateway), &config);
    Ok((config, engine))
}

pub fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
