//! Configuration for the compute daemon.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use stratus_networking::Ipv4Cidr;

use crate::addresses::AddressPlan;
use crate::naming::DEFAULT_BASE_URL;

/// Which container runtime backs instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// In-memory containers; nothing is actually run.
    Mock,
    /// Docker Engine over its Unix socket.
    Docker,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "docker" => Ok(Self::Docker),
            other => Err(anyhow!("unknown runtime '{other}' (expected mock or docker)")),
        }
    }
}

/// Compute daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Container runtime to drive.
    pub runtime: RuntimeKind,

    /// Docker Engine socket path.
    pub docker_socket: String,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    /// Grace period given to a container before a stop is forced.
    pub stop_grace: Duration,

    /// Slack past the grace period before a hung stop is escalated to a kill.
    pub stop_escalation: Duration,

    /// Upper bound on reconciler shutdown.
    pub shutdown_timeout: Duration,

    /// Base URL for self links.
    pub base_url: String,

    /// Image used when an insert does not name one.
    pub default_image: String,

    /// Address pools.
    pub addresses: AddressPlan,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("STRATUS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let runtime = lookup("STRATUS_RUNTIME")
            .map(|s| s.parse::<RuntimeKind>())
            .transpose()?
            .unwrap_or(RuntimeKind::Mock);

        let docker_socket = lookup("STRATUS_DOCKER_SOCKET")
            .unwrap_or_else(|| "/var/run/docker.sock".to_string());

        let reconcile_interval = secs(&lookup, "STRATUS_RECONCILE_INTERVAL_SECS", 5)?;
        if reconcile_interval.is_zero() {
            bail!("STRATUS_RECONCILE_INTERVAL_SECS must be greater than zero");
        }
        let stop_grace = secs(&lookup, "STRATUS_STOP_GRACE_SECS", 30)?;
        let stop_escalation = secs(&lookup, "STRATUS_STOP_ESCALATION_SECS", 5)?;
        let shutdown_timeout = secs(&lookup, "STRATUS_SHUTDOWN_TIMEOUT_SECS", 10)?;

        let base_url = lookup("STRATUS_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let default_image =
            lookup("STRATUS_DEFAULT_IMAGE").unwrap_or_else(|| "debian:bookworm-slim".to_string());

        let addresses = AddressPlan {
            subnets: region_map(&lookup, "STRATUS_SUBNETS")?,
            default_subnet: cidr(&lookup, "STRATUS_DEFAULT_SUBNET", "10.128.0.0/20")?,
            external_pools: region_map(&lookup, "STRATUS_EXTERNAL_POOLS")?,
            default_external_pool: cidr(&lookup, "STRATUS_DEFAULT_EXTERNAL_POOL", "203.0.113.0/24")?,
        };

        Ok(Self {
            log_level,
            runtime,
            docker_socket,
            reconcile_interval,
            stop_grace,
            stop_escalation,
            shutdown_timeout,
            base_url,
            default_image,
            addresses,
        })
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs = match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be a whole number of seconds, got '{value}'"))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

fn cidr(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<Ipv4Cidr> {
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} is not a valid CIDR: '{value}'"))
}

/// Parse `region=cidr,region=cidr`.
fn region_map(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<HashMap<String, Ipv4Cidr>> {
    let Some(value) = lookup(key) else {
        return Ok(HashMap::new());
    };

    let mut map = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (region, range) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("{key}: expected region=cidr, got '{entry}'"))?;
        let region = region.trim();
        if region.is_empty() {
            bail!("{key}: empty region in '{entry}'");
        }
        let range: Ipv4Cidr = range
            .trim()
            .parse()
            .with_context(|| format!("{key}: invalid CIDR for region {region}"))?;
        if map.insert(region.to_string(), range).is_some() {
            bail!("{key}: region {region} listed twice");
        }
    }
    Ok(map)
}
