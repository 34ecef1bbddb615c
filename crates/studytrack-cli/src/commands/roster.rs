//! Roster commands: students, guardians, activities.

use std::path::Path;

use clap::Subcommand;
use studytrack_core::{Activity, Config, CoreError, Guardian, RosterStore, Student};

use super::{open_store, print_json, CmdResult};

#[derive(Subcommand)]
pub enum RosterAction {
    /// Enroll a student
    AddStudent {
        name: String,
        /// User id on the presence channel
        #[arg(long)]
        external_id: Option<String>,
    },
    /// Add a guardian to a student
    AddGuardian {
        student_id: String,
        name: String,
    },
    /// Create an activity blocks can be assigned against
    AddActivity {
        name: String,
        /// Keep the activity but forbid new assignments
        #[arg(long)]
        not_assignable: bool,
    },
    /// Link or change a student's presence-channel id
    Link {
        student_id: String,
        external_id: String,
    },
    /// Stop tracking a student in the cohort view
    Unenroll { student_id: String },
    /// List enrolled students
    List,
}

pub fn run(db: Option<&Path>, action: RosterAction) -> CmdResult {
    let config = Config::load()?;
    let store = open_store(db, &config)?;

    match action {
        RosterAction::AddStudent { name, external_id } => {
            let student = Student::new(name, external_id);
            store.upsert_student(&student)?;
            print_json(&student)?;
        }
        RosterAction::AddGuardian { student_id, name } => {
            if store.get_student(&student_id)?.is_none() {
                return Err(CoreError::not_found("student", student_id).into());
            }
            let guardian = Guardian::new(student_id, name);
            store.insert_guardian(&guardian)?;
            print_json(&guardian)?;
        }
        RosterAction::AddActivity { name, not_assignable } => {
            let activity = Activity::new(name, !not_assignable);
            store.upsert_activity(&activity)?;
            print_json(&activity)?;
        }
        RosterAction::Link { student_id, external_id } => {
            let mut student = store
                .get_student(&student_id)?
                .ok_or_else(|| CoreError::not_found("student", &student_id))?;
            student.external_id = Some(external_id);
            store.upsert_student(&student)?;
            print_json(&student)?;
        }
        RosterAction::Unenroll { student_id } => {
            let mut student = store
                .get_student(&student_id)?
                .ok_or_else(|| CoreError::not_found("student", &student_id))?;
            student.enrolled = false;
            store.upsert_student(&student)?;
            println!("student unenrolled: {}", student.id);
        }
        RosterAction::List => {
            print_json(&store.enrolled_students()?)?;
        }
    }
    Ok(())
}
