use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ConnectionId;

/// Scheduling class of a job. Ordered so that `High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority {:?}", other)),
        }
    }
}

/// A submitted unit of work.
///
/// Progress, the running flag and watchers are live state and are not
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub handle: String,
    pub function: String,
    pub unique_id: String,
    pub payload: Bytes,
    pub priority: Priority,
    pub background: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub running: bool,
    #[serde(skip)]
    pub numerator: u64,
    #[serde(skip)]
    pub denominator: u64,
    #[serde(skip)]
    watchers: Vec<ConnectionId>,
}

impl Job {
    pub fn new(
        handle: String,
        function: String,
        unique_id: String,
        payload: Bytes,
        priority: Priority,
        background: bool,
    ) -> Self {
        Self {
            handle,
            function,
            unique_id,
            payload,
            priority,
            background,
            created_at: Utc::now(),
            running: false,
            numerator: 0,
            denominator: 0,
            watchers: Vec::new(),
        }
    }

    /// Attach the submitting connection. Only foreground jobs have a watcher,
    /// and only one.
    pub fn with_watcher(mut self, conn: ConnectionId) -> Self {
        debug_assert!(!self.background, "background jobs have no watchers");
        debug_assert!(self.watchers.is_empty(), "a job has a single watcher");
        self.watchers.push(conn);
        self
    }

    pub fn watchers(&self) -> &[ConnectionId] {
        &self.watchers
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            known: true,
            running: self.running,
            numerator: self.numerator,
            denominator: self.denominator,
        }
    }
}

/// Answer to a status query. Unknown handles report all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

impl JobStatus {
    pub fn unknown() -> Self {
        Self::default()
    }
}
