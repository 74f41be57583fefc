//! End-to-end replay runs over files produced by the coalescer.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use apiary_core::capture::CaptureReader;
use apiary_core::coalesce::{CoalesceConfig, CoalescedJob, Coalescer};
use apiary_core::codec::{IndexWriter, JobWriter};
use apiary_core::job::{IndexEntry, Job, Task};

use apiary_engine::adapter::{AdapterFactory, ProtocolAdapter};
use apiary_engine::telemetry::Telemetry;
use apiary_engine::{PoolOptions, ReplayOptions, RunConfig, start_replay};

#[derive(Debug, Clone)]
enum LogEntry {
    Start(String),
    Request(Vec<u8>, Instant),
    Finish(String),
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<LogEntry>>>);

impl Log {
    fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, predicate: impl Fn(&LogEntry) -> bool) -> usize {
        self.entries().iter().filter(|e| predicate(e)).count()
    }
}

struct RecordingAdapter {
    log: Log,
}

#[async_trait]
impl ProtocolAdapter for RecordingAdapter {
    async fn start_job(&mut self, job_id: &str) {
        self.log
            .0
            .lock()
            .unwrap()
            .push(LogEntry::Start(job_id.to_string()));
    }

    async fn send_request(&mut self, request: &[u8]) -> bool {
        self.log
            .0
            .lock()
            .unwrap()
            .push(LogEntry::Request(request.to_vec(), Instant::now()));
        true
    }

    async fn finish_job(&mut self, job_id: &str) {
        self.log
            .0
            .lock()
            .unwrap()
            .push(LogEntry::Finish(job_id.to_string()));
    }
}

struct RecordingFactory {
    log: Log,
}

impl AdapterFactory for RecordingFactory {
    fn name(&self) -> &'static str {
        "record"
    }

    fn build(&self, _telemetry: Telemetry) -> Box<dyn ProtocolAdapter> {
        Box::new(RecordingAdapter {
            log: self.log.clone(),
        })
    }
}

fn write_one(
    jobs: &mut JobWriter<BufWriter<File>>,
    index: &mut IndexWriter<BufWriter<File>>,
    coalesced: &CoalescedJob,
) {
    let offset = jobs.write(&coalesced.job).unwrap();
    index
        .write(&IndexEntry {
            id: coalesced.job.id.clone(),
            start_time: coalesced.start_time,
            offset,
        })
        .unwrap();
}

/// Runs the full offline pipeline over a capture string.
fn coalesce_capture(dir: &Path, capture: &str) -> (PathBuf, PathBuf) {
    let job_path = dir.join("jobs.bin");
    let index_path = dir.join("jobs.idx");
    let mut jobs = JobWriter::new(BufWriter::new(File::create(&job_path).unwrap()));
    let mut index = IndexWriter::new(BufWriter::new(File::create(&index_path).unwrap()));

    let mut coalescer = Coalescer::new(CoalesceConfig::default());
    for event in CaptureReader::new(capture.as_bytes()) {
        for coalesced in coalescer.push(event.unwrap()) {
            write_one(&mut jobs, &mut index, &coalesced);
        }
    }
    let (rest, _) = coalescer.finish();
    for coalesced in &rest {
        write_one(&mut jobs, &mut index, coalesced);
    }

    jobs.into_inner().flush().unwrap();
    index.into_inner().flush().unwrap();
    (job_path, index_path)
}

/// Writes synthetic job and index files directly.
fn write_jobs(dir: &Path, starts: &[(&str, f64)]) -> (PathBuf, PathBuf) {
    let job_path = dir.join("jobs.bin");
    let index_path = dir.join("jobs.idx");
    let mut jobs = JobWriter::new(BufWriter::new(File::create(&job_path).unwrap()));
    let mut index = IndexWriter::new(BufWriter::new(File::create(&index_path).unwrap()));
    for (id, at) in starts {
        let job = Job {
            id: id.to_string(),
            tasks: vec![Task {
                at: *at,
                request: b"req".to_vec(),
            }],
        };
        let offset = jobs.write(&job).unwrap();
        index
            .write(&IndexEntry {
                id: job.id,
                start_time: *at,
                offset,
            })
            .unwrap();
    }
    jobs.into_inner().flush().unwrap();
    index.into_inner().flush().unwrap();
    (job_path, index_path)
}

fn run_config(job_path: PathBuf, index_path: PathBuf) -> RunConfig {
    RunConfig {
        job_path,
        index_path: Some(index_path),
        replay: ReplayOptions::default(),
        pool: PoolOptions {
            workers: 1,
            threads: 1,
            ..Default::default()
        },
        stats_interval: Duration::from_secs(15),
    }
}

const SINGLE_SESSION: &str = "\
1.00\t10.0.0.1:5432\tdb\tQueryStart
A
**********
1.25\t10.0.0.1:5432\tdb\tQueryStart
B
**********
1.30\t10.0.0.1:5432\tdb\tQuit
**********
";

#[tokio::test]
async fn replays_one_session_with_captured_spacing() {
    let dir = tempfile::tempdir().unwrap();
    let (job_path, index_path) = coalesce_capture(dir.path(), SINGLE_SESSION);

    let log = Log::default();
    let handle = start_replay(
        run_config(job_path, index_path),
        Arc::new(RecordingFactory { log: log.clone() }),
    );
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.jobs_dispatched, 1);
    let entries = log.entries();
    assert_eq!(entries.len(), 4);
    assert!(matches!(&entries[0], LogEntry::Start(_)));
    assert!(matches!(&entries[3], LogEntry::Finish(_)));

    let (first_body, first_at) = match &entries[1] {
        LogEntry::Request(body, at) => (body.clone(), *at),
        other => panic!("expected request, got {other:?}"),
    };
    let (second_body, second_at) = match &entries[2] {
        LogEntry::Request(body, at) => (body.clone(), *at),
        other => panic!("expected request, got {other:?}"),
    };
    assert_eq!(first_body, b"A\n");
    assert_eq!(second_body, b"B\n");

    // Captured gap was 0.25s; allow generous pacing tolerance.
    let gap = second_at.duration_since(first_at);
    assert!(gap >= Duration::from_millis(200), "gap was {gap:?}");
    assert!(gap <= Duration::from_millis(600), "gap was {gap:?}");
}

#[tokio::test]
async fn dry_run_sends_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (job_path, index_path) = coalesce_capture(dir.path(), SINGLE_SESSION);

    let log = Log::default();
    let mut cfg = run_config(job_path, index_path);
    cfg.pool.dry_run = true;
    let handle = start_replay(cfg, Arc::new(RecordingFactory { log: log.clone() }));
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.jobs_dispatched, 1);
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn a_pool_drains_every_job_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let starts: Vec<(String, f64)> = (0..10).map(|i| (format!("j{i}"), 0.0)).collect();
    let refs: Vec<(&str, f64)> = starts.iter().map(|(id, at)| (id.as_str(), *at)).collect();
    let (job_path, index_path) = write_jobs(dir.path(), &refs);

    let log = Log::default();
    let mut cfg = run_config(job_path, index_path);
    cfg.replay.asap = true;
    cfg.pool.workers = 3;
    cfg.pool.threads = 2;
    let handle = start_replay(cfg, Arc::new(RecordingFactory { log: log.clone() }));
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.jobs_dispatched, 10);
    assert_eq!(log.count(|e| matches!(e, LogEntry::Start(_))), 10);
    assert_eq!(log.count(|e| matches!(e, LogEntry::Finish(_))), 10);
}

#[tokio::test]
async fn interrupt_stops_a_paced_run_promptly() {
    let dir = tempfile::tempdir().unwrap();
    // The second job is 1000 captured seconds out; without the interrupt the
    // scheduler would sleep for most of that.
    let (job_path, index_path) = write_jobs(dir.path(), &[("now", 0.0), ("later", 1000.0)]);

    let log = Log::default();
    let mut cfg = run_config(job_path, index_path);
    cfg.replay.max_ahead = 1.0;
    let handle = start_replay(cfg, Arc::new(RecordingFactory { log: log.clone() }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let started = Instant::now();
    handle.stopper().request_stop();
    let summary = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.jobs_dispatched, 1);
    assert_eq!(log.count(|e| matches!(e, LogEntry::Finish(_))), 1);
}
