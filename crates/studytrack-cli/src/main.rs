use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "studytrack", version, about = "Studytrack CLI")]
struct Cli {
    /// Database file (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Students, guardians and activities
    Roster {
        #[command(subcommand)]
        action: commands::roster::RosterAction,
    },
    /// Scheduled study blocks
    Block {
        #[command(subcommand)]
        action: commands::block::BlockAction,
    },
    /// Feed a presence event from the channel
    Presence {
        #[command(subcommand)]
        action: commands::presence::PresenceAction,
    },
    /// Process block window starts
    Tick {
        /// Look back this many minutes for window starts
        #[arg(long, default_value = "1")]
        since_minutes: i64,
    },
    /// Run the no-show and reminder sweeps once
    Sweep,
    /// Print the cohort status view as JSON
    Status {
        /// Range start (RFC 3339, default: 12 hours ago)
        #[arg(long)]
        from: Option<chrono::DateTime<chrono::Utc>>,
        /// Range end (RFC 3339, default: 12 hours from now)
        #[arg(long)]
        to: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Run the periodic tick and sweep until Ctrl-C
    Watch,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = cli.db.as_deref();
    let result = match cli.command {
        Commands::Roster { action } => commands::roster::run(db, action),
        Commands::Block { action } => commands::block::run(db, action),
        Commands::Presence { action } => commands::presence::run(db, action).await,
        Commands::Tick { since_minutes } => commands::tick::run_tick(db, since_minutes).await,
        Commands::Sweep => commands::tick::run_sweep(db).await,
        Commands::Status { from, to } => commands::status::run(db, from, to),
        Commands::Watch => commands::watch::run(db).await,
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
