//! Real attendance intervals and the presence events that produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded attendance span. `end` is `None` while the student is still present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceInterval {
    pub id: String,
    pub student_id: String,
    pub linked_block_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Channel tag of the presence source (free text)
    pub source: String,
}

impl AttendanceInterval {
    /// Open a new interval with a fresh id.
    pub fn open(
        student_id: impl Into<String>,
        linked_block_id: Option<String>,
        start: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            linked_block_id,
            start,
            end: None,
            source: source.into(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whether the student was present at `at` according to this interval.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        match self.end {
            Some(end) => self.start <= at && at <= end,
            None => self.start <= at,
        }
    }

    /// End timestamp to use when closing at `at`.
    ///
    /// Late-arriving events can carry a timestamp earlier than the interval's
    /// own start; the interval then collapses to zero length instead of
    /// ending before it began.
    pub fn clamp_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.max(self.start)
    }
}

/// Kind of presence transition reported by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceKind {
    Join,
    Leave,
    /// Switched from one channel to another without leaving.
    Move,
}

impl std::str::FromStr for PresenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "join" => Ok(PresenceKind::Join),
            "leave" => Ok(PresenceKind::Leave),
            "move" => Ok(PresenceKind::Move),
            other => Err(format!("unknown presence kind: {other}")),
        }
    }
}

/// A pushed event from the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// Presence-channel user id, mapped to a student through the roster.
    pub external_student_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PresenceKind,
    pub channel_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn open_interval_covers_everything_after_start() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
        let interval = AttendanceInterval::open("s1", None, start, "voice");
        assert!(interval.is_open());
        assert!(interval.covers(start + Duration::hours(5)));
        assert!(!interval.covers(start - Duration::seconds(1)));
    }

    #[test]
    fn clamp_end_never_precedes_start() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
        let interval = AttendanceInterval::open("s1", None, start, "voice");
        assert_eq!(interval.clamp_end(start - Duration::minutes(3)), start);
        assert_eq!(
            interval.clamp_end(start + Duration::minutes(3)),
            start + Duration::minutes(3)
        );
    }

    #[test]
    fn presence_kind_parses_case_insensitively() {
        assert_eq!("JOIN".parse::<PresenceKind>().unwrap(), PresenceKind::Join);
        assert_eq!("move".parse::<PresenceKind>().unwrap(), PresenceKind::Move);
        assert!("wave".parse::<PresenceKind>().is_err());
    }
}
