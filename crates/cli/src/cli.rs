use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use apiary_protocols::countdb::CountDbOptions;
use apiary_protocols::http::HttpOptions;
use apiary_protocols::mysql::MysqlOptions;
use apiary_protocols::test::TestOptions;
use apiary_protocols::ProtocolOptions;

#[derive(Debug, Parser)]
#[command(
    name = "apiary",
    version,
    about = "Replays captured query traffic against a live target"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log output (repeatable).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log debug messages.
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a coalesced job file against a live target.
    Replay(ReplayArgs),
    /// Merge capture files into a job file and index for replay.
    Coalesce(CoalesceArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Job file produced by `apiary coalesce`.
    pub jobs: PathBuf,

    /// Protocol of the captured traffic; must be a registered adapter.
    #[arg(long, env = "APIARY_PROTOCOL")]
    pub protocol: Option<String>,

    /// Index file (default: the job file with an `.idx` extension, when it
    /// exists; without one the job file is scanned linearly).
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Number of worker processes (default: 100).
    #[arg(short = 'w', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Threads per worker process (default: 1).
    #[arg(short = 't', long, value_name = "N")]
    pub threads: Option<usize>,

    /// Milliseconds between worker process starts.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub stagger_workers: u64,

    /// Milliseconds between thread starts within a worker process.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub stagger_threads: u64,

    /// Seconds between "ready" and the first dispatch.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0)]
    pub startup_wait: f64,

    /// Time multiple used when replaying. 2.0 means queries run twice as
    /// fast and the entire run takes half the time the capture ran for.
    #[arg(long, default_value_t = 1.0)]
    pub speedup: f64,

    /// Send queries as fast as possible, ignoring captured timing.
    #[arg(long)]
    pub asap: bool,

    /// How many seconds ahead of the workers the scheduler may get.
    #[arg(long, value_name = "SECONDS", default_value_t = 300.0)]
    pub max_ahead: f64,

    /// Shard stride: dispatch one job out of each group of N+1.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub skip: u64,

    /// Shard slot for this host, 0..=skip.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub offset: u64,

    /// Floor the ramp-down may not take --skip below.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub min_skip: u64,

    /// Seconds of capture time over which --skip decays by one (0 disables
    /// the ramp-down).
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0)]
    pub ramp_time: f64,

    /// Complete jobs without sending any requests.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Seconds between statistics reports.
    #[arg(short = 'i', long, value_name = "SECONDS", default_value_t = 15)]
    pub stats_interval: u64,

    /// Print timing totals at exit.
    #[arg(long)]
    pub profile: bool,

    #[command(flatten)]
    pub http: HttpArgs,

    #[command(flatten)]
    pub mysql: MysqlArgs,

    #[command(flatten)]
    pub countdb: CountDbArgs,

    #[command(flatten)]
    pub test: TestArgs,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "HTTP options (--protocol http)")]
pub struct HttpArgs {
    /// HTTP server to connect to.
    #[arg(long, value_name = "HOST", default_value = "localhost")]
    pub http_host: String,

    /// HTTP port to connect to.
    #[arg(long, value_name = "PORT", default_value_t = 80)]
    pub http_port: u16,

    /// Timeout for HTTP socket operations.
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    pub http_timeout: f64,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "MySQL options (--protocol mysql)")]
pub struct MysqlArgs {
    /// MySQL server to connect to.
    #[arg(long, value_name = "HOST", default_value = "localhost")]
    pub mysql_host: String,

    /// MySQL port to connect on.
    #[arg(long, value_name = "PORT", default_value_t = 3306)]
    pub mysql_port: u16,

    /// MySQL user to connect as.
    #[arg(long, value_name = "USER", default_value = "guest")]
    pub mysql_user: String,

    /// MySQL password to connect with.
    #[arg(long, value_name = "PW", default_value = "")]
    pub mysql_passwd: String,

    /// MySQL database to connect to.
    #[arg(long, value_name = "DB", default_value = "test")]
    pub mysql_db: String,

    /// MySQL connect timeout.
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    pub mysql_timeout: f64,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "CountDB options (--protocol countdb)")]
pub struct CountDbArgs {
    /// CountDB server to connect to.
    #[arg(long, value_name = "HOST", default_value = "localhost")]
    pub countdb_host: String,

    /// CountDB port to connect to.
    #[arg(long, value_name = "PORT", default_value_t = 3939)]
    pub countdb_port: u16,

    /// Timeout for CountDB socket operations.
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    pub countdb_timeout: f64,

    /// Maximum number of bytes to wait for in response to each request.
    #[arg(long, value_name = "BYTES", default_value_t = 1024)]
    pub countdb_recv_size: usize,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Test protocol options (--protocol test)")]
pub struct TestArgs {
    /// Minimum length of a simulated request, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.01)]
    pub min_duration: f64,

    /// Maximum length of a simulated request, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 1.2)]
    pub max_duration: f64,

    /// Probability of a simulated error on each request.
    #[arg(long, default_value_t = 0.01)]
    pub error_probability: f64,
}

impl ReplayArgs {
    pub fn protocol_options(&self) -> ProtocolOptions {
        ProtocolOptions {
            http: HttpOptions {
                host: self.http.http_host.clone(),
                port: self.http.http_port,
                timeout: secs(self.http.http_timeout),
                speedup: self.speedup,
            },
            mysql: MysqlOptions {
                host: self.mysql.mysql_host.clone(),
                port: self.mysql.mysql_port,
                user: self.mysql.mysql_user.clone(),
                password: self.mysql.mysql_passwd.clone(),
                database: self.mysql.mysql_db.clone(),
                connect_timeout: secs(self.mysql.mysql_timeout),
            },
            countdb: CountDbOptions {
                host: self.countdb.countdb_host.clone(),
                port: self.countdb.countdb_port,
                timeout: secs(self.countdb.countdb_timeout),
                recv_size: self.countdb.countdb_recv_size,
            },
            test: TestOptions {
                min_duration: self.test.min_duration,
                max_duration: self.test.max_duration,
                error_probability: self.test.error_probability,
            },
        }
    }
}

fn secs(seconds: f64) -> std::time::Duration {
    std::time::Duration::from_secs_f64(seconds.max(0.0))
}

#[derive(Debug, Args)]
pub struct CoalesceArgs {
    /// Capture files to merge; "-" (or no arguments) reads stdin.
    pub captures: Vec<String>,

    /// Job file to write.
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: PathBuf,

    /// Index file to write (default: the output with an `.idx` extension).
    #[arg(long, value_name = "FILE")]
    pub index: Option<PathBuf>,

    /// Seconds of quiescence after which an open session is force-closed.
    #[arg(long, value_name = "SECONDS", default_value_t = 300.0)]
    pub shelf_life: f64,

    /// Seconds after which an open session is force-closed regardless of
    /// activity.
    #[arg(long, value_name = "SECONDS", default_value_t = 900.0)]
    pub max_life: f64,
}
