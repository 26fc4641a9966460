//! Run value and state machine for one build attempt.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::context::Context;
use crate::launcher::RunHandle;

/// State of a run, as reported to clients and persisted in the store.
///
/// The discriminants are the persisted encoding; success is stored as
/// integer 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum RunState {
    Unknown = 0,
    Queued = 1,
    Running = 2,
    Aborted = 3,
    Failed = 4,
    Success = 5,
}

impl RunState {
    /// Decode a persisted result column. Null and out-of-range values
    /// both read back as `Unknown`.
    pub fn from_db(value: Option<i32>) -> Self {
        match value {
            Some(1) => RunState::Queued,
            Some(2) => RunState::Running,
            Some(3) => RunState::Aborted,
            Some(4) => RunState::Failed,
            Some(5) => RunState::Success,
            _ => RunState::Unknown,
        }
    }

    pub fn as_db(self) -> i32 {
        self as i32
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Aborted | RunState::Failed | RunState::Success
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Unknown => "unknown",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
            RunState::Success => "success",
        };
        f.write_str(s)
    }
}

/// One build attempt, identified by `(name, number)`.
///
/// Constructed when queued; the dispatcher is the only mutator. The
/// bound context is set at start and held strongly so the pool outlives
/// a config reload that drops it from the name map.
#[derive(Debug)]
pub struct Run {
    pub name: String,
    pub number: i64,
    pub params: HashMap<String, String>,
    pub reason: Option<String>,
    pub parent: Option<(String, i64)>,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<RunState>,
    pub context: Option<Arc<Context>>,
    pub handle: Option<RunHandle>,
    pub log: Vec<u8>,
    /// Seconds of started wall time before an abort is signalled; 0
    /// disables the timeout.
    pub timeout: u64,
}

impl Run {
    pub fn new(name: impl Into<String>, number: i64, params: HashMap<String, String>, queued_at: i64) -> Self {
        Self {
            name: name.into(),
            number,
            params,
            reason: None,
            parent: None,
            queued_at,
            started_at: None,
            completed_at: None,
            result: None,
            context: None,
            handle: None,
            log: Vec::new(),
            timeout: 0,
        }
    }

    /// Current state derived from the recorded timestamps.
    pub fn state(&self) -> RunState {
        match (self.result, self.started_at) {
            (Some(result), _) => result,
            (None, Some(_)) => RunState::Running,
            (None, None) => RunState::Queued,
        }
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}
