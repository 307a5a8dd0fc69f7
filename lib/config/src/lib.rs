//! Configuration snapshot consumed by every component of the compute fabric.
//!
//! A [`Config`] is built once, at process start, and then passed by reference or `Arc` into every
//! component's constructor. This replaces a global mutable configuration object (see the
//! "Global mutable configuration object" redesign note) so that tests can construct independent
//! configurations side by side.

pub mod logging;

use std::time::Duration;

pub use logging::{LogFormat, LogLevel, OutputLocation};

/// Default TCP port a node listens on when none is given in its address.
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Bound on how many ports `net` will probe past the configured one on `EADDRINUSE`.
pub const TCP_PORT_PROBE_LIMIT: u16 = 1000;

/// `bndl.net` / `bndl.compute` configuration, read once at startup.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct Config {
    /// `bndl.net.listen_addresses` — addresses this node listens on.
    #[cfg_attr(
        feature = "clap",
        arg(long = "listen-address", env = "BNDL_NET_LISTEN_ADDRESSES")
    )]
    pub listen_addresses: Vec<String>,

    /// `bndl.net.seeds` — bootstrap peer addresses.
    #[cfg_attr(feature = "clap", arg(long = "seed", env = "BNDL_NET_SEEDS"))]
    pub seeds: Vec<String>,

    /// `bndl.compute.worker_count` — number of executor processes per host. Supervisor input,
    /// not consulted by the scheduler itself.
    #[cfg_attr(
        feature = "clap",
        arg(long, default_value_t = num_cpus(), env = "BNDL_COMPUTE_WORKER_COUNT")
    )]
    pub worker_count: usize,

    /// `bndl.compute.attempts` — maximum attempts per task. `1` means no retry.
    #[cfg_attr(
        feature = "clap",
        arg(long, default_value_t = 1, env = "BNDL_COMPUTE_ATTEMPTS")
    )]
    pub attempts: usize,

    /// `bndl.compute.memory.limit` — advisory memory ceiling used by external spill logic. Not
    /// interpreted by the core.
    #[cfg_attr(feature = "clap", arg(long, env = "BNDL_COMPUTE_MEMORY_LIMIT"))]
    pub memory_limit: Option<u64>,

    /// Interval between watchdog liveness probes sent to each connected peer.
    #[cfg_attr(
        feature = "clap",
        arg(long, value_parser = parse_duration_secs, default_value = "5")
    )]
    pub watchdog_interval: Duration,

    /// Consecutive missed watchdog pings before a peer is disconnected.
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 3))]
    pub watchdog_missed_pings: u32,

    /// Initial backoff before retrying an unreachable seed.
    #[cfg_attr(
        feature = "clap",
        arg(long, value_parser = parse_duration_secs, default_value = "1")
    )]
    pub seed_retry_initial: Duration,

    /// Maximum backoff between seed retries.
    #[cfg_attr(
        feature = "clap",
        arg(long, value_parser = parse_duration_secs, default_value = "30")
    )]
    pub seed_retry_max: Duration,

    /// Timeout for a hello exchange to complete.
    #[cfg_attr(
        feature = "clap",
        arg(long, value_parser = parse_duration_millis, default_value = "2000")
    )]
    pub hello_timeout: Duration,

    /// Timeout for an availability query round when selecting a block's download source.
    #[cfg_attr(
        feature = "clap",
        arg(long, value_parser = parse_duration_millis, default_value = "1000")
    )]
    pub availability_timeout: Duration,

    /// Logging output format.
    #[cfg_attr(feature = "clap", arg(long, value_enum, default_value_t = LogFormat::Pretty))]
    pub log_format: LogFormat,

    /// Logging verbosity. If not set, `RUST_LOG` is consulted.
    #[cfg_attr(feature = "clap", arg(long, value_enum))]
    pub log_level: Option<LogLevel>,

    /// Where log output is written.
    #[cfg_attr(feature = "clap", arg(long, value_enum, default_value_t = OutputLocation::Stderr))]
    pub output_location: OutputLocation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addresses: Vec::new(),
            seeds: Vec::new(),
            worker_count: num_cpus(),
            attempts: 1,
            memory_limit: None,
            watchdog_interval: Duration::from_secs(5),
            watchdog_missed_pings: 3,
            seed_retry_initial: Duration::from_secs(1),
            seed_retry_max: Duration::from_secs(30),
            hello_timeout: Duration::from_millis(2000),
            availability_timeout: Duration::from_millis(1000),
            log_format: LogFormat::Pretty,
            log_level: None,
            output_location: OutputLocation::Stderr,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(feature = "clap")]
fn parse_duration_secs(v: &str) -> Result<Duration, String> {
    v.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

#[cfg(feature = "clap")]
fn parse_duration_millis(v: &str) -> Result<Duration, String> {
    v.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| e.to_string())
}
