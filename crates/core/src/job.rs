use serde::{Deserialize, Serialize};

/// One replayable request within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Seconds since the capture origin.
    pub at: f64,
    /// Raw request bytes handed to the protocol adapter.
    pub request: Vec<u8>,
}

/// The scheduler-visible form of one captured session: the ordered requests
/// of a single connection, with their captured offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique within one capture.
    pub id: String,
    /// Non-empty, non-decreasing in `at`.
    pub tasks: Vec<Task>,
}

impl Job {
    pub fn start_time(&self) -> f64 {
        self.tasks.first().map(|t| t.at).unwrap_or(0.0)
    }
}

/// One record of the job index, ordered by `start_time`. The offset points at
/// the start of the job's frame in the job file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub start_time: f64,
    pub offset: u64,
}
