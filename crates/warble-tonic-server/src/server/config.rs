use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use warble_tonic_core::warble::{PostIdGenerator, WallClock};

/// Runtime configuration for the `warble-tonic-server` binary.
///
/// These settings control the fan-out concurrency, broker sizing, and
/// aggregation behavior of the compose-post service. All values are parsed
/// from CLI arguments or environment variables, with defaults suitable for a
/// single-node deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "warble-tonic-server",
    version,
    about = "A gRPC service for composing posts and fanning them out to home timelines"
)]
pub struct CliArgs {
    /// Number of fan-out workers consuming this instance's region queue.
    ///
    /// Each worker borrows one broker channel for its lifetime and writes
    /// home-timeline entries for one delivery at a time.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Machine id encoded into every post id, one to three hex digits.
    ///
    /// Post ids embed this value verbatim, so two instances sharing a
    /// machine id will collide. Assign a distinct value per instance.
    ///
    /// Environment variable: `MACHINE_ID`
    #[arg(long, env = "MACHINE_ID", default_value_t = String::from("0"))]
    pub machine_id: String,

    /// Region whose fan-out queue this instance consumes.
    ///
    /// Environment variable: `REGION`
    #[arg(long, env = "REGION", default_value_t = String::from("local"))]
    pub region: String,

    /// Comma-separated regions every composed post is published to.
    ///
    /// One fan-out message goes out per listed region. Must include
    /// `REGION`, since the broker lives in-process and no other instance
    /// can drain the queues this one fills.
    ///
    /// Environment variable: `REGIONS`
    #[arg(long, env = "REGIONS", value_delimiter = ',', default_value = "local")]
    pub regions: Vec<String>,

    /// Maximum number of broker channels the shared pool may hold.
    ///
    /// Fan-out workers pin one channel each for their lifetime, so this
    /// must exceed `NUM_WORKERS` or publishing would starve.
    ///
    /// Environment variable: `POOL_MAX_SIZE`
    #[arg(long, env = "POOL_MAX_SIZE", default_value_t = 8)]
    pub pool_max_size: usize,

    /// How long a publish may wait for a pooled channel, in milliseconds.
    ///
    /// Environment variable: `POOL_WAIT_MS`
    #[arg(long, env = "POOL_WAIT_MS", default_value_t = 5_000)]
    pub pool_wait_ms: u64,

    /// How long a partially uploaded post may sit in the component buffer
    /// before it is dropped, in seconds. Every upload refreshes it.
    ///
    /// Environment variable: `COMPONENT_TTL_SECS`
    #[arg(long, env = "COMPONENT_TTL_SECS", default_value_t = 12)]
    pub component_ttl_secs: u64,

    /// Capacity of each fan-out queue, in messages.
    ///
    /// Publishers block once a queue is full, which backpressures the
    /// compose path instead of growing memory without bound.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1_024)]
    pub queue_capacity: usize,

    /// How many times a failed delivery is requeued before it is dropped.
    ///
    /// Environment variable: `MAX_REDELIVERIES`
    #[arg(long, env = "MAX_REDELIVERIES", default_value_t = 3)]
    pub max_redeliveries: u32,

    /// Upper bound on graceful shutdown, in seconds: first draining
    /// in-flight uploads, then stopping fan-out workers.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,

    /// Path to a JSON file of `{user_id, followers}` records used to seed
    /// the social graph at startup. Empty graph when unset.
    ///
    /// Environment variable: `SEED_GRAPH`
    #[arg(long, env = "SEED_GRAPH")]
    pub seed_graph: Option<PathBuf>,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/warble-uds.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub machine_id: String,
    pub region: String,
    pub regions: Vec<String>,
    pub pool_max_size: usize,
    pub pool_wait: Duration,
    pub component_ttl: Duration,
    pub queue_capacity: usize,
    pub max_redeliveries: u32,
    pub shutdown_timeout: Duration,
    pub seed_graph: Option<PathBuf>,
    pub server_addr: String,
    pub uds: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        // The generator owns the machine-id rules; run them here so a bad
        // value fails at argument parsing rather than mid-startup.
        if let Err(err) = PostIdGenerator::new(&args.machine_id, WallClock) {
            bail!("MACHINE_ID rejected: {err}");
        }

        if args.regions.is_empty() {
            bail!("REGIONS must name at least one region");
        }

        if !args.regions.contains(&args.region) {
            bail!(
                "REGION `{}` is not listed in REGIONS ({})",
                args.region,
                args.regions.join(",")
            );
        }

        if args.pool_max_size <= args.num_workers {
            bail!(
                "POOL_MAX_SIZE ({}) must exceed NUM_WORKERS ({}): each fan-out \
                 worker holds a channel, and publishing needs at least one more",
                args.pool_max_size,
                args.num_workers
            );
        }

        if args.component_ttl_secs == 0 {
            bail!("COMPONENT_TTL_SECS must be greater than 0");
        }

        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        Ok(Self {
            num_workers: args.num_workers,
            machine_id: args.machine_id,
            region: args.region,
            regions: args.regions,
            pool_max_size: args.pool_max_size,
            pool_wait: Duration::from_millis(args.pool_wait_ms),
            component_ttl: Duration::from_secs(args.component_ttl_secs),
            queue_capacity: args.queue_capacity,
            max_redeliveries: args.max_redeliveries,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            seed_graph: args.seed_graph,
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("warble-tonic-server").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_pass_validation() {
        let config = ServerConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.regions, vec!["local".to_owned()]);
        assert_eq!(config.component_ttl, Duration::from_secs(12));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn regions_split_on_commas_and_must_cover_the_home_region() {
        let config = ServerConfig::try_from(args(&[
            "--region",
            "eu",
            "--regions",
            "us,eu,apac",
        ]))
        .unwrap();
        assert_eq!(config.regions, vec!["us", "eu", "apac"]);

        let err = ServerConfig::try_from(args(&["--region", "mars", "--regions", "us,eu"]))
            .unwrap_err();
        assert!(err.to_string().contains("REGION `mars`"));
    }

    #[test]
    fn pool_must_outnumber_the_workers() {
        let err = ServerConfig::try_from(args(&["--num-workers", "8", "--pool-max-size", "8"]))
            .unwrap_err();
        assert!(err.to_string().contains("POOL_MAX_SIZE"));
    }

    #[test]
    fn bad_machine_ids_fail_at_parse_time() {
        for bad in ["", "zz", "12345"] {
            let result = ServerConfig::try_from(args(&["--machine-id", bad]));
            assert!(result.is_err(), "machine id `{bad}` should be rejected");
        }
        assert!(ServerConfig::try_from(args(&["--machine-id", "1A"])).is_ok());
    }
}
