mod cli;
mod config;
mod shutdown;

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write as _};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use apiary_core::capture::CaptureReader;
use apiary_core::coalesce::{CoalesceConfig, CoalescedJob, Coalescer};
use apiary_core::codec::{FormatError, IndexWriter, JobWriter};
use apiary_core::job::IndexEntry;
use apiary_core::merge::MergedEvents;
use apiary_engine::{PoolOptions, ReplayOptions, RunConfig};

use crate::cli::{Cli, CoalesceArgs, Command, ReplayArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    match cli.command {
        Command::Replay(args) => run_replay(args).await,
        Command::Coalesce(args) => run_coalesce(args),
    }
}

fn init_tracing(verbose: u8, debug: bool) {
    let level = if debug {
        "debug"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let defaults = match config::load_defaults() {
        Ok(defaults) => defaults.unwrap_or_default(),
        Err(err) => {
            tracing::warn!("failed to read the defaults file: {err:#}");
            config::Defaults::default()
        }
    };

    let protocol = args
        .protocol
        .clone()
        .or(defaults.protocol)
        .context("--protocol is required")?;
    let registry = apiary_protocols::default_registry(args.protocol_options());
    let factory = registry.get(&protocol).with_context(|| {
        format!(
            "unknown protocol {:?}; supported protocols: {}",
            protocol,
            registry.names().join(", ")
        )
    })?;

    let workers = args.workers.or(defaults.workers).unwrap_or(100);
    let threads = args.threads.or(defaults.threads).unwrap_or(1);
    if workers == 0 || threads == 0 {
        anyhow::bail!("--workers and --threads must be >= 1");
    }
    if !args.asap && !(args.speedup > 0.0) {
        anyhow::bail!("--speedup must be positive");
    }
    if args.skip > 0 && args.offset > args.skip {
        anyhow::bail!("--offset must be <= --skip");
    }

    let index_path = args.index.clone().or_else(|| {
        let sibling = args.jobs.with_extension("idx");
        sibling.exists().then_some(sibling)
    });

    let run = RunConfig {
        job_path: args.jobs.clone(),
        index_path,
        replay: ReplayOptions {
            speedup: args.speedup,
            asap: args.asap,
            max_ahead: args.max_ahead,
            skip: args.skip,
            offset: args.offset,
            min_skip: args.min_skip,
            ramp_time: args.ramp_time,
            startup_wait: args.startup_wait,
        },
        pool: PoolOptions {
            workers,
            threads,
            stagger_workers: Duration::from_millis(args.stagger_workers),
            stagger_threads: Duration::from_millis(args.stagger_threads),
            dry_run: args.dry_run,
        },
        stats_interval: Duration::from_secs(args.stats_interval.max(1)),
    };

    let started = Instant::now();
    let handle = apiary_engine::start_replay(run, factory);
    shutdown::spawn_ctrl_c_handler(handle.stopper());
    handle.wait().await?;

    if args.profile {
        println!(
            "Timing: {:.2} seconds wall clock.",
            started.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

fn run_coalesce(args: CoalesceArgs) -> anyhow::Result<()> {
    let inputs: Vec<String> = if args.captures.is_empty() {
        vec!["-".to_string()]
    } else {
        args.captures.clone()
    };

    let mut sources: Vec<CaptureReader<Box<dyn BufRead>>> = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let reader: Box<dyn BufRead> = if input == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file =
                File::open(input).with_context(|| format!("opening capture file {input}"))?;
            Box::new(BufReader::new(file))
        };
        sources.push(CaptureReader::new(reader));
    }

    let index_path = args
        .index
        .clone()
        .unwrap_or_else(|| args.output.with_extension("idx"));
    let job_file = File::create(&args.output)
        .with_context(|| format!("creating job file {}", args.output.display()))?;
    let index_file = File::create(&index_path)
        .with_context(|| format!("creating index file {}", index_path.display()))?;
    let mut jobs = JobWriter::new(BufWriter::new(job_file));
    let mut index = IndexWriter::new(BufWriter::new(index_file));

    let mut coalescer = Coalescer::new(CoalesceConfig {
        shelf_life: args.shelf_life,
        max_life: args.max_life,
    });

    let mut written = 0u64;
    for event in MergedEvents::new(sources) {
        let event = event.context("reading capture stream")?;
        for coalesced in coalescer.push(event) {
            write_coalesced(&mut jobs, &mut index, &coalesced)?;
            written += 1;
        }
    }
    let (rest, summary) = coalescer.finish();
    for coalesced in &rest {
        write_coalesced(&mut jobs, &mut index, coalesced)?;
        written += 1;
    }

    jobs.into_inner().flush().context("flushing job file")?;
    index.into_inner().flush().context("flushing index file")?;

    println!(
        "Wrote {written} jobs to {} ({} events, {} sessions, {} aged out).",
        args.output.display(),
        summary.events,
        summary.sessions,
        summary.aged_out
    );
    Ok(())
}

/// One record in each file, atomically paired: the job frame, then the index
/// entry pointing at it.
fn write_coalesced(
    jobs: &mut JobWriter<BufWriter<File>>,
    index: &mut IndexWriter<BufWriter<File>>,
    coalesced: &CoalescedJob,
) -> Result<(), FormatError> {
    let offset = jobs.write(&coalesced.job)?;
    index.write(&IndexEntry {
        id: coalesced.job.id.clone(),
        start_time: coalesced.start_time,
        offset,
    })
}
