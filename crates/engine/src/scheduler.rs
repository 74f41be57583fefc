//! The QueenBee: streams indexed jobs off disk at their captured offsets,
//! scaled by the speedup, into the job queue.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::watch;

use apiary_core::codec::{FormatError, IndexReader, JobScan};
use apiary_core::job::IndexEntry;

use crate::api::{JobDescriptor, ReplayOptions, wall_now};
use crate::queue::QueueItem;

/// How far behind the pace counts as falling behind.
const BEHIND_THRESHOLD: f64 = -10.0;
/// Minimum spacing between fall-behind warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct SchedulerConfig {
    pub job_path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub replay: ReplayOptions,
}

/// Where dispatchable jobs come from: the index when one exists, otherwise a
/// linear scan of the job file (the offsets it reports keep descriptors
/// seekable either way).
enum DispatchSource {
    Indexed(IndexReader<BufReader<File>>),
    Scan(JobScan<BufReader<File>>),
}

impl Iterator for DispatchSource {
    type Item = Result<IndexEntry, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            DispatchSource::Indexed(entries) => entries.next(),
            DispatchSource::Scan(scan) => scan.next().map(|res| {
                res.map(|(offset, job)| IndexEntry {
                    start_time: job.start_time(),
                    id: job.id,
                    offset,
                })
            }),
        }
    }
}

fn open_source(cfg: &SchedulerConfig) -> anyhow::Result<DispatchSource> {
    if let Some(index_path) = &cfg.index_path {
        if index_path.exists() {
            let file = File::open(index_path)
                .with_context(|| format!("opening index file {}", index_path.display()))?;
            return Ok(DispatchSource::Indexed(IndexReader::new(BufReader::new(
                file,
            ))));
        }
        tracing::warn!(
            index = %index_path.display(),
            "index file missing; falling back to a linear scan of the job file"
        );
    }
    let file = File::open(&cfg.job_path)
        .with_context(|| format!("opening job file {}", cfg.job_path.display()))?;
    Ok(DispatchSource::Scan(JobScan::new(BufReader::new(file))))
}

/// Runs the scheduler to EOF or until `stop` flips. Returns the number of
/// jobs dispatched, which is also stored in `jobs_sent` once at the end.
pub(crate) async fn run_scheduler(
    cfg: SchedulerConfig,
    queue: async_channel::Sender<QueueItem>,
    jobs_sent: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<u64> {
    let mut source = open_source(&cfg)?;
    let replay = cfg.replay.clone();
    let asap = replay.effective_asap();
    let time_scale = replay.time_scale();
    let origin = wall_now() + replay.startup_wait;

    let mut dispatched: u64 = 0;
    let mut current_skip = replay.skip;
    let mut skip_counter = replay.skip;
    let mut last_second: i64 = 0;
    let mut last_warning: Option<Instant> = None;

    tracing::info!(job_file = %cfg.job_path.display(), "scheduler started");

    loop {
        if *stop.borrow() {
            tracing::info!("scheduler interrupted");
            break;
        }
        let Some(entry) = source.next() else {
            // EOF: drain and let the supervisor fan out stop sentinels.
            break;
        };
        let entry = entry.context("reading job stream")?;

        // Ramp-down: decay the shard stride as capture time advances.
        let second = entry.start_time.floor() as i64;
        if second > last_second {
            if replay.ramp_time > 0.0 && replay.skip > 0 {
                let decay = (second as f64 / replay.ramp_time).floor() as u64;
                current_skip = replay.skip.saturating_sub(decay).max(replay.min_skip);
            }
            last_second = second;
        }

        // Skip/offset sharding: N+1 hosts started with offsets 0..=N cover
        // the stream disjointly.
        if current_skip > 0 {
            if skip_counter == 0 {
                skip_counter = current_skip;
            } else {
                skip_counter -= 1;
            }
            if skip_counter != replay.offset {
                continue;
            }
        }

        if !asap {
            let target_delay = entry.start_time * time_scale - (wall_now() - origin);
            if target_delay > replay.max_ahead {
                // Bounded look-ahead: sleeping here is what caps queue depth.
                let nap = Duration::from_secs_f64(target_delay - replay.max_ahead);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    res = stop.changed() => {
                        if res.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            } else if target_delay < BEHIND_THRESHOLD {
                let due = last_warning
                    .map(|at| at.elapsed() >= WARN_INTERVAL)
                    .unwrap_or(true);
                if due {
                    tracing::warn!("scheduler is {:.2} seconds behind", -target_delay);
                    last_warning = Some(Instant::now());
                }
            }
        }

        let descriptor = JobDescriptor {
            replay_origin: origin,
            job_id: entry.id,
            job_path: cfg.job_path.clone(),
            offset: entry.offset,
        };
        tokio::select! {
            res = queue.send(QueueItem::Job(descriptor)) => {
                if res.is_err() {
                    tracing::warn!("job queue closed; stopping dispatch");
                    break;
                }
                dispatched += 1;
            }
            res = stop.changed() => {
                if res.is_err() {
                    break;
                }
                continue;
            }
        }
    }

    jobs_sent.store(dispatched, Ordering::SeqCst);
    tracing::info!(jobs = dispatched, "scheduler drained");
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use std::io::BufWriter;

    use apiary_core::codec::{IndexWriter, JobWriter};
    use apiary_core::job::{Job, Task};

    use super::*;

    fn job(id: &str, at: f64) -> Job {
        Job {
            id: id.to_string(),
            tasks: vec![Task {
                at,
                request: b"req".to_vec(),
            }],
        }
    }

    fn write_fixture(dir: &std::path::Path, starts: &[(&str, f64)]) -> (PathBuf, PathBuf) {
        let job_path = dir.join("jobs.bin");
        let index_path = dir.join("jobs.idx");
        let mut jobs = JobWriter::new(BufWriter::new(File::create(&job_path).unwrap()));
        let mut index = IndexWriter::new(BufWriter::new(File::create(&index_path).unwrap()));
        for (id, at) in starts {
            let job = job(id, *at);
            let offset = jobs.write(&job).unwrap();
            index
                .write(&IndexEntry {
                    id: job.id.clone(),
                    start_time: *at,
                    offset,
                })
                .unwrap();
        }
        use std::io::Write as _;
        jobs.into_inner().flush().unwrap();
        index.into_inner().flush().unwrap();
        (job_path, index_path)
    }

    async fn dispatch_ids(cfg: SchedulerConfig) -> Vec<String> {
        let (tx, rx) = async_channel::bounded(64);
        let jobs_sent = Arc::new(AtomicU64::new(0));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let sent = run_scheduler(cfg, tx, jobs_sent.clone(), stop_rx)
            .await
            .unwrap();

        let mut ids = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let QueueItem::Job(descriptor) = item {
                ids.push(descriptor.job_id);
            }
        }
        assert_eq!(sent as usize, ids.len());
        assert_eq!(jobs_sent.load(Ordering::SeqCst) as usize, ids.len());
        ids
    }

    fn asap_config(job_path: &PathBuf, index_path: Option<&PathBuf>) -> SchedulerConfig {
        SchedulerConfig {
            job_path: job_path.clone(),
            index_path: index_path.cloned(),
            replay: ReplayOptions {
                asap: true,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn dispatches_every_indexed_job_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (job_path, index_path) =
            write_fixture(dir.path(), &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);

        let ids = dispatch_ids(asap_config(&job_path, Some(&index_path))).await;
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn linear_scan_fallback_matches_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let (job_path, _) = write_fixture(dir.path(), &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);

        let ids = dispatch_ids(asap_config(&job_path, None)).await;
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn sharding_covers_the_stream_disjointly() {
        let dir = tempfile::tempdir().unwrap();
        let (job_path, index_path) =
            write_fixture(dir.path(), &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);

        let mut shard = |offset: u64| {
            let mut cfg = asap_config(&job_path, Some(&index_path));
            cfg.replay.skip = 1;
            cfg.replay.offset = offset;
            cfg
        };

        let first = dispatch_ids(shard(0)).await;
        let second = dispatch_ids(shard(1)).await;
        assert_eq!(first, vec!["a", "c"]);
        assert_eq!(second, vec!["b"]);
    }

    #[tokio::test]
    async fn pacing_holds_dispatch_to_the_captured_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let (job_path, index_path) = write_fixture(dir.path(), &[("a", 0.0), ("b", 0.4)]);

        let mut cfg = asap_config(&job_path, Some(&index_path));
        cfg.replay.asap = false;
        cfg.replay.speedup = 1.0;
        cfg.replay.max_ahead = 0.0;

        let started = Instant::now();
        let ids = dispatch_ids(cfg).await;
        assert_eq!(ids.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn stop_request_halts_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (job_path, index_path) =
            write_fixture(dir.path(), &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);

        let (tx, _rx) = async_channel::bounded(64);
        let jobs_sent = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let sent = run_scheduler(
            asap_config(&job_path, Some(&index_path)),
            tx,
            jobs_sent,
            stop_rx,
        )
        .await
        .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn ramp_down_drops_the_stride_to_min_skip() {
        let dir = tempfile::tempdir().unwrap();
        // One job per second for eight seconds.
        let starts: Vec<(String, f64)> = (0..8).map(|i| (format!("j{i}"), i as f64)).collect();
        let refs: Vec<(&str, f64)> = starts.iter().map(|(id, at)| (id.as_str(), *at)).collect();
        let (job_path, index_path) = write_fixture(dir.path(), &refs);

        // skip decays by one every 2 captured seconds, floored at 0: the
        // tail of the stream replays unsharded.
        let mut cfg = asap_config(&job_path, Some(&index_path));
        cfg.replay.skip = 2;
        cfg.replay.offset = 0;
        cfg.replay.min_skip = 0;
        cfg.replay.ramp_time = 2.0;

        let ids = dispatch_ids(cfg).await;
        // Once the stride hits zero every remaining job is dispatched.
        assert!(ids.len() > 8 / 3);
        let tail: Vec<&String> = ids.iter().filter(|id| id.as_str() >= "j4").collect();
        assert_eq!(tail.len(), 4);
    }
}
