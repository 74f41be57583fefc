//! The worker pool: W worker groups each supervising T worker tasks. The
//! two-level shape mirrors the process-per-worker layout of the original
//! deployment; a panicking adapter takes down only its own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::adapter::AdapterFactory;
use crate::api::{PoolOptions, ReplayOptions};
use crate::queue::QueueItem;
use crate::telemetry::Telemetry;
use crate::worker::{WorkerContext, run_worker};

/// Spawns every worker group. Group starts are staggered by
/// `stagger_workers`, thread starts within a group by `stagger_threads`, so
/// targets that rate-limit new connections are not stormed.
pub(crate) fn start_worker_pool(
    pool: &PoolOptions,
    replay: &ReplayOptions,
    factory: Arc<dyn AdapterFactory>,
    queue: async_channel::Receiver<QueueItem>,
    telemetry: Telemetry,
) -> JoinSet<()> {
    let mut groups = JoinSet::new();
    let time_scale = replay.time_scale();
    for group in 0..pool.workers {
        let start_delay = pool.stagger_workers * group as u32;
        groups.spawn(run_worker_group(GroupConfig {
            group,
            start_delay,
            threads: pool.threads,
            stagger_threads: pool.stagger_threads,
            time_scale,
            dry_run: pool.dry_run,
            factory: factory.clone(),
            queue: queue.clone(),
            telemetry: telemetry.clone(),
        }));
    }
    groups
}

struct GroupConfig {
    group: usize,
    start_delay: Duration,
    threads: usize,
    stagger_threads: Duration,
    time_scale: f64,
    dry_run: bool,
    factory: Arc<dyn AdapterFactory>,
    queue: async_channel::Receiver<QueueItem>,
    telemetry: Telemetry,
}

async fn run_worker_group(cfg: GroupConfig) {
    if !cfg.start_delay.is_zero() {
        tokio::time::sleep(cfg.start_delay).await;
    }

    let mut workers = JoinSet::new();
    for thread in 0..cfg.threads {
        if thread > 0 && !cfg.stagger_threads.is_zero() {
            tokio::time::sleep(cfg.stagger_threads).await;
        }
        let ctx = WorkerContext {
            group: cfg.group,
            thread,
            time_scale: cfg.time_scale,
            dry_run: cfg.dry_run,
            telemetry: cfg.telemetry.clone(),
        };
        let adapter = cfg.factory.build(cfg.telemetry.clone());
        workers.spawn(run_worker(ctx, cfg.queue.clone(), adapter));
    }
    tracing::debug!(group = cfg.group, threads = cfg.threads, "worker group started");

    while let Some(res) = workers.join_next().await {
        if let Err(err) = res {
            if err.is_panic() {
                tracing::error!(group = cfg.group, "worker task panicked: {err}");
            }
        }
    }
    tracing::debug!(group = cfg.group, "worker group stopped");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::adapter::ProtocolAdapter;
    use crate::queue::job_queue;
    use crate::telemetry::stats_channel;

    struct NullAdapter;

    #[async_trait]
    impl ProtocolAdapter for NullAdapter {
        async fn start_job(&mut self, _job_id: &str) {}
        async fn send_request(&mut self, _request: &[u8]) -> bool {
            true
        }
        async fn finish_job(&mut self, _job_id: &str) {}
    }

    struct NullFactory;

    impl AdapterFactory for NullFactory {
        fn name(&self) -> &'static str {
            "null"
        }
        fn build(&self, _telemetry: Telemetry) -> Box<dyn ProtocolAdapter> {
            Box::new(NullAdapter)
        }
    }

    #[tokio::test]
    async fn one_stop_sentinel_per_worker_drains_the_pool() {
        let pool = PoolOptions {
            workers: 2,
            threads: 3,
            ..Default::default()
        };
        let replay = ReplayOptions::default();
        let (telemetry, _stats_rx) = stats_channel();
        let (tx, rx) = job_queue();

        let mut groups = start_worker_pool(&pool, &replay, Arc::new(NullFactory), rx, telemetry);
        for _ in 0..pool.workers * pool.threads {
            tx.send(QueueItem::Stop).await.unwrap();
        }
        while let Some(res) = groups.join_next().await {
            res.unwrap();
        }
        // Every sentinel was consumed; none left on the queue.
        assert!(tx.is_empty());
    }
}
