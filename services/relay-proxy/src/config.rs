//! Proxy configuration.
//!
//! Two sources, merged once at startup:
//! - an optional JSON file (`config.json` in the working directory by default)
//! - command line arguments, which override file values
//!
//! Workers from both sources are combined, file entries first. The resolved
//! [`Config`] is validated here; the tunneling core trusts it as-is.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::proxy::{ProxyKind, RelayEndpoint, RetryPolicy, Strategy, TunnelConfig};

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

const USAGE_HINT: &str = "Usage: relay-proxy [options] <socks|http> --worker <worker>";

/// Proxy requests through WebSocket relay workers.
#[derive(Debug, Parser)]
#[command(name = "relay-proxy")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Example: relay-proxy -v -a auth-secret socks my-instance.workers.dev")]
pub struct Cli {
    /// Proxy type (`socks` or `http`) and relay worker hostnames.
    #[arg(value_name = "socks|http|WORKER")]
    pub args: Vec<String>,

    /// Port to listen on (defaults to 1080 for socks and 8080 for http).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to listen on.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Authorization header sent to relay workers.
    #[arg(short = 'a', long = "auth")]
    pub authorization: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Worker endpoint, can be given multiple times.
    #[arg(long = "worker", value_name = "ENDPOINT")]
    pub workers: Vec<String>,

    /// Load balancing strategy: "random" or "round-robin".
    #[arg(long)]
    pub strategy: Option<String>,

    /// Retry failed relay connections with exponential backoff.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub retry_enabled: Option<bool>,

    /// Maximum number of retries after the first failure.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub retry_initial_backoff: Option<u64>,

    /// Multiplier for the exponential backoff.
    #[arg(long)]
    pub retry_factor: Option<f64>,

    /// JSON config file; CLI arguments override its values.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,
}

/// `worker` in the config file: one endpoint or a list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerList {
    One(String),
    Many(Vec<String>),
}

impl WorkerList {
    fn into_vec(self) -> Vec<String> {
        match self {
            WorkerList::One(worker) => vec![worker],
            WorkerList::Many(workers) => workers,
        }
    }
}

/// Contents of the JSON config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub worker: Option<WorkerList>,
    #[serde(alias = "strategy")]
    pub load_balancing_strategy: Option<String>,
    pub authorization: Option<String>,
    pub verbose: Option<bool>,
    pub retry_enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_initial_backoff: Option<u64>,
    pub retry_factor: Option<f64>,
}

impl FileConfig {
    /// Read a config file. A missing file is `Ok(None)`.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        serde_json::from_str(&contents)
            .map(Some)
            .with_context(|| format!("Failed to parse config from {:?}", path))
    }
}

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub kind: ProxyKind,
    pub bind_addr: SocketAddr,
    pub workers: Vec<RelayEndpoint>,
    pub strategy: Strategy,
    pub authorization: Option<String>,
    pub verbose: bool,
    pub retry: RetryPolicy,
    pub log_json: bool,
}

impl Config {
    /// Merge CLI arguments over file values and validate the result.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self> {
        let mut kind = match file.kind.as_deref() {
            // An unrecognized file type is left for the CLI to supply.
            Some(name) => name.parse::<ProxyKind>().ok(),
            None => None,
        };

        let mut workers: Vec<String> = file.worker.map(WorkerList::into_vec).unwrap_or_default();

        for arg in &cli.args {
            if let Ok(parsed) = arg.parse::<ProxyKind>() {
                kind = Some(parsed);
            } else if is_worker_name(arg) {
                workers.push(arg.clone());
            } else {
                bail!("Invalid option: {arg}\n{USAGE_HINT}");
            }
        }
        workers.extend(cli.workers);

        let Some(kind) = kind else {
            bail!("Missing proxy type. Provide `socks` or `http` via CLI or config file\n{USAGE_HINT}");
        };
        ensure!(
            !workers.is_empty(),
            "Missing relay workers. Provide at least one worker via CLI or config file\n{USAGE_HINT}"
        );
        if let Some(empty) = workers.iter().position(|w| w.trim().is_empty()) {
            bail!("Worker #{} is empty", empty + 1);
        }

        let port = cli
            .port
            .or(file.port)
            .unwrap_or_else(|| kind.default_port());
        let bind = cli
            .bind
            .or(file.bind)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let strategy = cli
            .strategy
            .or(file.load_balancing_strategy)
            .map(|name| Strategy::from_name(&name))
            .unwrap_or_default();

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            enabled: cli
                .retry_enabled
                .or(file.retry_enabled)
                .unwrap_or(defaults.enabled),
            max_retries: cli
                .max_retries
                .or(file.max_retries)
                .unwrap_or(defaults.max_retries),
            initial_backoff: cli
                .retry_initial_backoff
                .or(file.retry_initial_backoff)
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            factor: cli
                .retry_factor
                .or(file.retry_factor)
                .unwrap_or(defaults.factor),
        };
        ensure!(
            retry.factor.is_finite() && retry.factor >= 0.0,
            "Retry factor must be a non-negative number, got {}",
            retry.factor
        );

        Ok(Self {
            kind,
            bind_addr: SocketAddr::new(bind, port),
            workers: workers.iter().map(RelayEndpoint::new).collect(),
            strategy,
            authorization: cli.authorization.or(file.authorization),
            verbose: cli.verbose || file.verbose.unwrap_or(false),
            retry,
            log_json: cli.log_json,
        })
    }

    /// Session settings derived from this configuration.
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            strategy: self.strategy,
            retry: self.retry,
            ..TunnelConfig::new(self.kind, self.workers.clone())
        }
    }
}

/// Positional worker names look like `label(.label)+`.
fn is_worker_name(arg: &str) -> bool {
    let valid_label = |label: &str| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    arg.contains('.') && arg.split('.').all(valid_label)
}
