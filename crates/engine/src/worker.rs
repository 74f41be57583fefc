//! A worker task: takes job descriptors off the queue, decodes the job frame
//! at the descriptor's offset, paces each request to its captured time, and
//! drives the protocol adapter. Runs until it dequeues a stop sentinel.

use std::time::{Duration, Instant};

use apiary_core::codec::{self, FormatError};
use apiary_core::job::Job;

use crate::adapter::ProtocolAdapter;
use crate::api::{JobDescriptor, wall_now};
use crate::queue::QueueItem;
use crate::telemetry::{Sign, Telemetry};

/// Waits longer than this get logged, so captures with large idle gaps are
/// visible to operators.
const LONG_WAIT_NOTICE: f64 = 120.0;

pub(crate) struct WorkerContext {
    pub group: usize,
    pub thread: usize,
    /// Multiplier applied to captured task offsets; 0 disables pacing.
    pub time_scale: f64,
    pub dry_run: bool,
    pub telemetry: Telemetry,
}

pub(crate) async fn run_worker(
    ctx: WorkerContext,
    queue: async_channel::Receiver<QueueItem>,
    mut adapter: Box<dyn ProtocolAdapter>,
) {
    tracing::debug!(group = ctx.group, thread = ctx.thread, "worker started");
    while let Ok(item) = queue.recv().await {
        match item {
            QueueItem::Stop => break,
            QueueItem::Job(descriptor) => replay_job(&ctx, adapter.as_mut(), descriptor).await,
        }
    }
    tracing::debug!(group = ctx.group, thread = ctx.thread, "worker stopped");
}

async fn replay_job(
    ctx: &WorkerContext,
    adapter: &mut dyn ProtocolAdapter,
    descriptor: JobDescriptor,
) {
    let job = match load_job(&descriptor).await {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(job = %descriptor.job_id, "failed to load job: {err:#}");
            ctx.telemetry.error(format!("job load failed: {err}"));
            return;
        }
    };
    if job.id != descriptor.job_id {
        // The frame at this offset is not the job the descriptor promised.
        tracing::error!(
            expected = %descriptor.job_id,
            found = %job.id,
            offset = descriptor.offset,
            "job id mismatch; skipping job"
        );
        ctx.telemetry.error("job id mismatch");
        return;
    }
    if ctx.dry_run {
        ctx.telemetry.tally("Job completed successfully");
        return;
    }

    if job.tasks.is_empty() {
        // Nothing to replay, but the adapter still gets its finish hook;
        // adapters treat missing per-session state as a no-op.
        adapter.finish_job(&job.id).await;
        return;
    }

    let telemetry = &ctx.telemetry;
    let mut started = false;
    let mut failed = false;
    for task in &job.tasks {
        // time_scale is exactly 0.0 in asap mode: every target collapses to
        // the replay origin and pacing drops out.
        let target = task.at * ctx.time_scale + descriptor.replay_origin;
        let wait = target - wall_now();
        if wait > 0.0 {
            if wait > LONG_WAIT_NOTICE {
                tracing::info!(
                    job = %job.id,
                    wait_s = wait.round() as i64,
                    "long wait before next request"
                );
            }
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        if !started {
            started = true;
            telemetry.level("Jobs Running", Sign::Up);
            adapter.start_job(&job.id).await;
        }

        telemetry.level("Requests Running", Sign::Up);
        let sent_at = Instant::now();
        let ok = adapter.send_request(&task.request).await;
        telemetry.series(
            "Request Duration (ms)",
            sent_at.elapsed().as_secs_f64() * 1000.0,
        );
        telemetry.level("Requests Running", Sign::Down);

        if !ok {
            // A failed connection or transactional error makes the rest of
            // the captured sequence meaningless.
            failed = true;
            break;
        }
    }

    if started {
        adapter.finish_job(&job.id).await;
        telemetry.level("Jobs Running", Sign::Down);
    }
    if !failed {
        telemetry.tally("Job completed successfully");
    }
}

async fn load_job(descriptor: &JobDescriptor) -> Result<Job, FormatError> {
    let path = descriptor.job_path.clone();
    let offset = descriptor.offset;
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(path)?;
        codec::read_job_at(&mut file, offset)
    })
    .await
    .map_err(|err| FormatError::Io(std::io::Error::other(err)))?
}
