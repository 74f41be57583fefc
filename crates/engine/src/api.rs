//! Public API types for the replay engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterFactory;
use crate::supervisor::SupervisorInner;

/// Scheduling knobs for one replay run.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Time multiple; 2.0 replays twice as fast as captured.
    pub speedup: f64,
    /// Dispatch as fast as possible, ignoring captured timing.
    pub asap: bool,
    /// How many seconds of work the scheduler may stay ahead of the workers.
    pub max_ahead: f64,
    /// Shard stride: with `skip` N, every run dispatches one job out of each
    /// group of N+1.
    pub skip: u64,
    /// Shard slot for this host, `0..=skip`.
    pub offset: u64,
    /// Floor the ramp-down may not take `skip` below.
    pub min_skip: u64,
    /// Seconds of capture time over which `skip` decays by one; 0 disables
    /// the ramp-down.
    pub ramp_time: f64,
    /// Seconds between process start and the replay origin.
    pub startup_wait: f64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speedup: 1.0,
            asap: false,
            max_ahead: 300.0,
            skip: 0,
            offset: 0,
            min_skip: 0,
            ramp_time: 0.0,
            startup_wait: 0.0,
        }
    }
}

impl ReplayOptions {
    /// An infinite speedup degenerates to asap.
    pub fn effective_asap(&self) -> bool {
        self.asap || self.speedup.is_infinite()
    }

    /// Multiplier applied to captured offsets; 0 when pacing is disabled.
    pub fn time_scale(&self) -> f64 {
        if self.effective_asap() {
            0.0
        } else {
            1.0 / self.speedup
        }
    }
}

/// Worker-pool shape.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of worker groups (the original's worker processes).
    pub workers: usize,
    /// Worker tasks per group.
    pub threads: usize,
    /// Delay between group starts, to smooth connection-open storms.
    pub stagger_workers: Duration,
    /// Delay between task starts within a group.
    pub stagger_threads: Duration,
    /// Complete jobs without sending any requests.
    pub dry_run: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 100,
            threads: 1,
            stagger_workers: Duration::ZERO,
            stagger_threads: Duration::ZERO,
            dry_run: false,
        }
    }
}

/// Everything the supervisor needs to run one replay.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Job file produced by the coalescer.
    pub job_path: PathBuf,
    /// Index file; when absent the scheduler falls back to a linear scan of
    /// the job file.
    pub index_path: Option<PathBuf>,
    pub replay: ReplayOptions,
    pub pool: PoolOptions,
    /// Period of the statistics reports.
    pub stats_interval: Duration,
}

/// Fully self-describing pointer to one job frame. Workers open the job file
/// themselves, so descriptors carry everything needed to find and pace the
/// job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Wall-clock replay origin, seconds since the Unix epoch.
    pub replay_origin: f64,
    pub job_id: String,
    pub job_path: PathBuf,
    pub offset: u64,
}

/// Final tallies for a completed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub jobs_dispatched: u64,
    pub elapsed: Duration,
}

/// Wall clock as fractional seconds since the Unix epoch.
pub fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Handle to a running replay.
pub struct ReplayHandle {
    pub(crate) inner: Arc<SupervisorInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<RunSummary>>,
}

/// Cloneable stop switch for a running replay, for signal handlers.
#[derive(Clone)]
pub struct ReplayStopper {
    pub(crate) inner: Arc<SupervisorInner>,
}

impl ReplayStopper {
    /// Request a graceful shutdown: the scheduler stops dispatching, workers
    /// finish their current jobs and drain stop sentinels.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }
}

impl ReplayHandle {
    pub fn stopper(&self) -> ReplayStopper {
        ReplayStopper {
            inner: self.inner.clone(),
        }
    }

    /// Waits for the run to finish and returns its summary.
    pub async fn wait(self) -> anyhow::Result<RunSummary> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("supervisor task join error: {err}")),
        }
    }
}

/// Starts a replay run: workers first, then the stats collector, then the
/// scheduler.
pub fn start_replay(config: RunConfig, factory: Arc<dyn AdapterFactory>) -> ReplayHandle {
    crate::supervisor::start_replay(config, factory)
}
