use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a dispatched job: `Pending → Running → Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// The counter movement a lifecycle event implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Pending → Running: `pending -= 1`, `running += 1`.
    Started,
    /// The job left the given state for good.
    Finished { from: JobState },
    /// Already in (or past) the target state; nothing to apply.
    Duplicate,
}

/// A single job instance known to this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub process: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Seen running before its start request resolved, with no pending slot
    /// to convert. The dispatcher settles this once the start returns.
    #[serde(default)]
    pub uncounted: bool,
}

impl JobRecord {
    pub fn new(id: i64, process: impl Into<String>, state: JobState) -> Self {
        let now = Utc::now();
        Self {
            id,
            process: process.into(),
            state,
            created_at: now,
            updated_at: now,
            uncounted: false,
        }
    }

    /// Apply a "job created" event.
    pub fn start(&mut self) -> Transition {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Running;
                self.updated_at = Utc::now();
                Transition::Started
            }
            JobState::Running | JobState::Finished => Transition::Duplicate,
        }
    }

    /// Apply a "job finished" event.
    pub fn finish(&mut self) -> Transition {
        match self.state {
            JobState::Finished => Transition::Duplicate,
            from => {
                self.state = JobState::Finished;
                self.updated_at = Utc::now();
                Transition::Finished { from }
            }
        }
    }
}
