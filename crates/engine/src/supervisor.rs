//! The BeeKeeper: spawns the worker pool, the stats collector, and the
//! scheduler in that order, then runs the sentinel-based shutdown sequence
//! when the scheduler drains or a stop is requested.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::adapter::AdapterFactory;
use crate::api::{ReplayHandle, RunConfig, RunSummary};
use crate::collector::run_stats_collector;
use crate::pool::start_worker_pool;
use crate::queue::{QueueItem, job_queue};
use crate::scheduler::{SchedulerConfig, run_scheduler};
use crate::telemetry::stats_channel;

/// Join budget beyond the look-ahead cap before workers are aborted.
const JOIN_SLACK: Duration = Duration::from_secs(30);

pub struct SupervisorInner {
    stop_requested: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SupervisorInner {
    fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_requested: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("stop requested; terminating the scheduler");
            let _ = self.stop_tx.send(true);
        }
    }

    fn stop_was_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) fn start_replay(config: RunConfig, factory: Arc<dyn AdapterFactory>) -> ReplayHandle {
    let inner = Arc::new(SupervisorInner::new());
    let join = tokio::spawn(run_supervisor(config, factory, inner.clone()));
    ReplayHandle { inner, join }
}

async fn run_supervisor(
    config: RunConfig,
    factory: Arc<dyn AdapterFactory>,
    inner: Arc<SupervisorInner>,
) -> anyhow::Result<RunSummary> {
    let started_at = Instant::now();
    let (job_tx, job_rx) = job_queue();
    let (telemetry, stats_rx) = stats_channel();

    // Startup order: workers, then the stats collector, then the scheduler.
    let mut groups = start_worker_pool(
        &config.pool,
        &config.replay,
        factory,
        job_rx.clone(),
        telemetry.clone(),
    );
    let collector = tokio::spawn(run_stats_collector(stats_rx, config.stats_interval));

    let jobs_sent = Arc::new(AtomicU64::new(0));
    let scheduler = tokio::spawn(run_scheduler(
        SchedulerConfig {
            job_path: config.job_path.clone(),
            index_path: config.index_path.clone(),
            replay: config.replay.clone(),
        },
        job_tx.clone(),
        jobs_sent.clone(),
        inner.stop_tx.subscribe(),
    ));

    let scheduler_result = match scheduler.await {
        Ok(res) => res.map(|_| ()),
        Err(err) => Err(anyhow::anyhow!("scheduler task join error: {err}")),
    };

    // An interrupted run abandons work that was queued but never picked up;
    // workers only finish the jobs they already hold.
    if inner.stop_was_requested() {
        let mut discarded = 0u64;
        while job_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::info!(discarded, "dropped undispatched jobs from the queue");
        }
    }

    // Shutdown: exactly one stop sentinel per worker task, then join the
    // pool within the look-ahead budget.
    let sentinels = config.pool.workers * config.pool.threads;
    tracing::info!(
        sentinels,
        "waiting up to {} seconds for workers to finish",
        config.replay.max_ahead.max(0.0) as u64 + JOIN_SLACK.as_secs()
    );
    // Fan the sentinels out from a task: with more workers than queue slots
    // the sends block until workers drain them, and the join deadline below
    // must keep ticking meanwhile.
    let sentinel_tx = job_tx.clone();
    let sentinel_task = tokio::spawn(async move {
        for _ in 0..sentinels {
            if sentinel_tx.send(QueueItem::Stop).await.is_err() {
                break;
            }
        }
    });

    let deadline = tokio::time::Instant::now()
        + Duration::from_secs_f64(config.replay.max_ahead.max(0.0))
        + JOIN_SLACK;
    loop {
        let joined = tokio::time::timeout_at(deadline, groups.join_next()).await;
        match joined {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("workers did not stop in time; aborting the rest");
                groups.abort_all();
                while groups.join_next().await.is_some() {}
                break;
            }
        }
    }
    sentinel_task.abort();

    // The collector drains last so telemetry sent during worker shutdown is
    // still counted in the final report.
    telemetry.stop();
    if let Err(err) = collector.await {
        tracing::error!("stats collector join error: {err}");
    }

    let summary = RunSummary {
        jobs_dispatched: jobs_sent.load(Ordering::SeqCst),
        elapsed: started_at.elapsed(),
    };
    println!(
        "Completed {} jobs in {:.2} seconds.",
        summary.jobs_dispatched,
        summary.elapsed.as_secs_f64()
    );
    scheduler_result?;
    Ok(summary)
}
