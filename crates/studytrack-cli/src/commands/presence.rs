//! Presence commands: feed join, leave and move events by hand.

use std::path::Path;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use studytrack_core::{PresenceEvent, PresenceKind};

use super::{open_engine, print_json, CmdResult};

#[derive(Args)]
pub struct EventArgs {
    /// User id on the presence channel
    external_id: String,
    /// Event time (RFC 3339, default: now)
    #[arg(long)]
    at: Option<DateTime<Utc>>,
    /// Channel tag recorded on the interval
    #[arg(long, default_value = "cli")]
    channel: String,
}

#[derive(Subcommand)]
pub enum PresenceAction {
    /// Student joined the channel
    Join(EventArgs),
    /// Student left the channel
    Leave(EventArgs),
    /// Student switched channels
    Move(EventArgs),
}

pub async fn run(db: Option<&Path>, action: PresenceAction) -> CmdResult {
    let (kind, args) = match action {
        PresenceAction::Join(args) => (PresenceKind::Join, args),
        PresenceAction::Leave(args) => (PresenceKind::Leave, args),
        PresenceAction::Move(args) => (PresenceKind::Move, args),
    };
    let (_config, engine) = open_engine(db)?;

    let mut report = engine
        .handle_presence(PresenceEvent {
            external_student_id: args.external_id,
            timestamp: args.at.unwrap_or_else(Utc::now),
            kind,
            channel_tag: args.channel,
        })
        .await?;
    if let Some(delivery) = report.delivery.take() {
        delivery.await?;
    }
    print_json(&report)
}
