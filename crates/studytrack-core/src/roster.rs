//! Students, guardians and activities as flat id-referenced records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    /// User id on the presence channel, if the student linked one.
    pub external_id: Option<String>,
    pub enrolled: bool,
}

impl Student {
    pub fn new(name: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            external_id,
            enrolled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: String,
    pub student_id: String,
    pub name: String,
}

impl Guardian {
    pub fn new(student_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    /// Whether blocks may be assigned against this activity.
    pub assignable: bool,
}

impl Activity {
    pub fn new(name: impl Into<String>, assignable: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            assignable,
        }
    }
}
