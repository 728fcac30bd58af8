use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::conntrack::Config;
use crate::model::ConnectionType;

#[derive(Parser, Debug)]
#[command(
    name = "natcache",
    version,
    about = "Kernel conntrack NAT translation cache for flow monitoring"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load the cache, follow live updates for a while, then print its stats
    Snapshot(SnapshotArgs),
    /// Load the cache and print the translation of a single connection
    Lookup(LookupArgs),
}

/// Arguments shared by every subcommand that builds a cache.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Root of the proc filesystem used to find conntrack tables
    #[arg(long, default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Maximum number of cached entries [default: 65536]
    #[arg(long, default_value_t = 65_536, value_parser = validate_state_size)]
    pub max_state_size: usize,

    /// Maximum conntrack records processed per second [default: 500]
    #[arg(long, default_value_t = 500, value_parser = validate_rate_limit)]
    pub rate_limit: usize,

    /// Read the conntrack table of every network namespace
    #[arg(long)]
    pub all_namespaces: bool,

    /// Seconds between conntrack table polls [default: 2.0]
    #[arg(long, default_value_t = 2.0, value_parser = validate_interval)]
    pub poll_interval: f64,
}

impl CacheArgs {
    pub fn to_config(&self) -> Config {
        Config {
            proc_root: self.proc_root.clone(),
            max_state_size: self.max_state_size,
            target_rate_limit: self.rate_limit,
            listen_all_namespaces: self.all_namespaces,
            poll_interval: Duration::from_secs_f64(self.poll_interval),
            ..Config::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Output format [default: tsv]
    #[arg(long, default_value = "tsv")]
    pub format: OutputFormat,

    /// How long to follow live updates before printing, in seconds [default: 5.0]
    #[arg(long, default_value_t = 5.0, value_parser = validate_duration)]
    pub duration: f64,

    /// Also print every cached translation
    #[arg(long)]
    pub entries: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LookupArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Observed source address, e.g. 10.0.0.5:4000
    #[arg(long)]
    pub src: SocketAddr,

    /// Observed destination address, e.g. 8.8.8.8:443
    #[arg(long)]
    pub dst: SocketAddr,

    /// Transport protocol [default: tcp]
    #[arg(long, default_value = "tcp")]
    pub proto: Transport,

    /// Output format [default: tsv]
    #[arg(long, default_value = "tsv")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Tsv,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl From<Transport> for ConnectionType {
    fn from(t: Transport) -> Self {
        match t {
            Transport::Tcp => ConnectionType::Tcp,
            Transport::Udp => ConnectionType::Udp,
        }
    }
}

fn validate_state_size(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("max-state-size must be at least 1".to_string())
    } else {
        Ok(val)
    }
}

fn validate_rate_limit(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("rate-limit must be at least 1 record per second".to_string())
    } else {
        Ok(val)
    }
}

fn validate_interval(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if val < 0.1 {
        Err("poll-interval must be at least 0.1 seconds".to_string())
    } else if val > 60.0 {
        Err("poll-interval must be at most 60.0 seconds".to_string())
    } else {
        Ok(val)
    }
}

fn validate_duration(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if val < 0.0 {
        Err("duration must not be negative".to_string())
    } else if val > 3600.0 {
        Err("duration must be at most 3600 seconds".to_string())
    } else {
        Ok(val)
    }
}
