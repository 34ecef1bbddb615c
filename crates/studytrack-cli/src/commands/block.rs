//! Block commands: assign, update, delete, list.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use studytrack_core::{AssignmentCommand, BlockPatch, Config, ScheduleService};

use super::{open_store, print_json, CmdResult};

#[derive(Subcommand)]
pub enum BlockAction {
    /// Schedule a study block for a student
    Assign {
        #[arg(long)]
        student: String,
        #[arg(long)]
        activity: String,
        #[arg(long)]
        title: String,
        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,
        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,
        /// Who scheduled the block
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Change a block's title, activity or window
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        activity: Option<String>,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Delete a block; its attendance stays but loses the link
    Delete { id: String },
    /// Show one block
    Get { id: String },
    /// List a student's blocks intersecting a range
    List {
        #[arg(long)]
        student: String,
        /// Range start (default: 1 day ago)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Range end (default: 7 days from now)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

pub fn run(db: Option<&Path>, action: BlockAction) -> CmdResult {
    let config = Config::load()?;
    let service = ScheduleService::new(open_store(db, &config)?);
    let now = Utc::now();

    match action {
        BlockAction::Assign {
            student,
            activity,
            title,
            start,
            end,
            actor,
        } => {
            let block = service.assign(
                AssignmentCommand {
                    student_id: student,
                    title,
                    activity_id: activity,
                    start,
                    end,
                    actor_id: actor,
                },
                now,
            )?;
            print_json(&block)?;
        }
        BlockAction::Update {
            id,
            title,
            activity,
            start,
            end,
        } => {
            let patch = BlockPatch {
                title,
                activity_id: activity,
                start,
                end,
            };
            print_json(&service.update(&id, patch, now)?)?;
        }
        BlockAction::Delete { id } => {
            let unlinked = service.delete(&id)?;
            println!("block deleted: {id} ({unlinked} intervals unlinked)");
        }
        BlockAction::Get { id } => {
            print_json(&service.get(&id)?)?;
        }
        BlockAction::List { student, from, to } => {
            let from = from.unwrap_or(now - Duration::days(1));
            let to = to.unwrap_or(now + Duration::days(7));
            print_json(&service.query_overlapping(&student, from, to)?)?;
        }
    }
    Ok(())
}
