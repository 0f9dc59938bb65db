use anyhow::Context;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// PZEM-004T general broadcast address, answered by any single meter on the bus
pub const PZEM_DEFAULT_ADDRESS: u8 = 0xF8;

/// Credentials handed to the network link on every (re)connect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkCredentials {
    pub ssid: String,
    pub password: String,
}

/// Timing policy of the control loop. All values are in milliseconds of loop time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub send_interval_ms: u64,
    pub remote_retry_ms: u64,
    pub max_remote_failures: u32,
    pub link_backoff: Duration,
    pub remote_unready_delay: Duration,
    pub link_restart_settle: Duration,
    pub pacing: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 1000,
            remote_retry_ms: 10_000,
            max_remote_failures: 5,
            link_backoff: Duration::from_millis(5000),
            remote_unready_delay: Duration::from_millis(1000),
            link_restart_settle: Duration::from_millis(1000),
            pacing: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: LinkCredentials,
    pub firebase_url: String,
    pub firebase_auth: String,
    /// Meter gateway as `host:port`; host may be a name or an IP address
    pub pzem_address: String,
    pub pzem_slave: u8,
    pub remote_timeout: Duration,
    pub timing: LoopConfig,
}

impl Config {
    /// Reads the whole configuration from the environment.
    /// Only the database host and the meter gateway address are mandatory.
    pub fn from_env() -> anyhow::Result<Self> {
        let firebase_host =
            env::var("FIREBASE_HOST").context("FIREBASE_HOST must name the realtime database")?;
        let pzem_modbus = env::var("PZEM_MODBUS")
            .context("PZEM_MODBUS must hold the meter gateway address (host:port)")?;
        let pzem_address = parse_gateway_address(&pzem_modbus)
            .with_context(|| format!("Invalid PZEM_MODBUS address `{pzem_modbus}`"))?;

        let defaults = LoopConfig::default();
        let timing = LoopConfig {
            send_interval_ms: env_or("SEND_INTERVAL_MS", defaults.send_interval_ms),
            remote_retry_ms: env_or("REMOTE_RETRY_MS", defaults.remote_retry_ms),
            max_remote_failures: env_or("MAX_REMOTE_FAILURES", defaults.max_remote_failures),
            link_backoff: env_millis("LINK_BACKOFF_MS", defaults.link_backoff),
            remote_unready_delay: env_millis(
                "REMOTE_UNREADY_DELAY_MS",
                defaults.remote_unready_delay,
            ),
            link_restart_settle: env_millis(
                "LINK_RESTART_SETTLE_MS",
                defaults.link_restart_settle,
            ),
            pacing: env_millis("LOOP_PACING_MS", defaults.pacing),
        };

        Ok(Self {
            credentials: LinkCredentials {
                ssid: env::var("WIFI_SSID").unwrap_or_default(),
                password: env::var("WIFI_PASSWORD").unwrap_or_default(),
            },
            firebase_url: normalize_base_url(&firebase_host),
            firebase_auth: env::var("FIREBASE_AUTH").unwrap_or_default(),
            pzem_address,
            pzem_slave: env_or("PZEM_ADDRESS", PZEM_DEFAULT_ADDRESS),
            remote_timeout: env_millis("REMOTE_TIMEOUT_MS", Duration::from_secs(10)),
            timing,
        })
    }
}

/// Accepts a bare database host and turns it into an https base URL without a trailing slash
pub fn normalize_base_url(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Checks the `host:port` shape without resolving the host
fn parse_gateway_address(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim();
    let (host, port) = trimmed.rsplit_once(':').context("expected host:port")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    anyhow::ensure!(!host.is_empty(), "missing host");
    port.parse::<u16>().with_context(|| format!("invalid port `{port}`"))?;
    Ok(trimmed.to_string())
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    parse_or_default(name, env::var(name).ok(), default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_or(name, millis))
}

/// Parses an optional setting, falling back to the default when unset or malformed
fn parse_or_default<T: FromStr + Copy + std::fmt::Display>(
    name: &str,
    val: Option<String>,
    default: T,
) -> T {
    match val {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(setting = name, value = %raw, %default, "Ignoring malformed setting");
            default
        }),
    }
}
