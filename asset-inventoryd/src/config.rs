use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{bail, Context, Result};

/// Longest claim lease a config may ask for (thirty days)
pub const MAX_CLAIM_LEASE_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// One address or CIDR network per line
    #[serde(default = "default_asset_file")]
    pub file: PathBuf,
    /// Largest network a single asset line may expand to
    #[serde(default = "default_max_network_hosts")]
    pub max_network_hosts: u64,
}

/// Which hosts the continuous liveness refresh cycles through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshScope {
    #[default]
    All,
    Up,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_ping_binary")]
    pub binary: String,
    /// Echo requests per probe
    #[serde(default = "default_ping_count")]
    pub count: u32,
    /// Seconds to wait for each reply
    #[serde(default = "default_ping_wait")]
    pub wait_secs: u64,
    /// Whole-process budget for one ping invocation
    #[serde(default = "default_ping_budget")]
    pub time_budget_secs: u64,
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
    /// Pause between continuous refresh iterations
    #[serde(default = "default_refresh_delay")]
    pub refresh_delay_secs: u64,
    #[serde(default)]
    pub refresh_scope: RefreshScope,
    #[serde(default = "default_liveness_lease")]
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_nmap_binary")]
    pub binary: String,
    /// nmap timing template (-T0 .. -T5) for port and service scans
    #[serde(default = "default_timing_template")]
    pub timing_template: u8,
    #[serde(default = "default_os_concurrency")]
    pub os_concurrency: usize,
    #[serde(default = "default_os_host_timeout")]
    pub os_host_timeout_secs: u64,
    #[serde(default = "default_port_host_timeout")]
    pub port_host_timeout_secs: u64,
    #[serde(default = "default_service_host_timeout")]
    pub service_host_timeout_secs: u64,
    #[serde(default = "default_fingerprint_lease")]
    pub claim_lease_secs: u64,
    /// Wait when no host or service is due for a refresh
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("inventory.db")
}

fn default_asset_file() -> PathBuf {
    PathBuf::from("asset.lst")
}

fn default_max_network_hosts() -> u64 {
    65_536
}

fn default_ping_binary() -> String {
    "ping".to_string()
}

fn default_ping_count() -> u32 {
    3
}

fn default_ping_wait() -> u64 {
    1
}

fn default_ping_budget() -> u64 {
    15
}

fn default_sweep_concurrency() -> usize {
    240
}

fn default_refresh_delay() -> u64 {
    20
}

fn default_liveness_lease() -> u64 {
    300
}

fn default_nmap_binary() -> String {
    "nmap".to_string()
}

fn default_timing_template() -> u8 {
    4
}

fn default_os_concurrency() -> usize {
    10
}

fn default_os_host_timeout() -> u64 {
    360
}

fn default_port_host_timeout() -> u64 {
    360
}

fn default_service_host_timeout() -> u64 {
    20
}

fn default_fingerprint_lease() -> u64 {
    3600
}

fn default_idle_delay() -> u64 {
    60
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            file: default_asset_file(),
            max_network_hosts: default_max_network_hosts(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            binary: default_ping_binary(),
            count: default_ping_count(),
            wait_secs: default_ping_wait(),
            time_budget_secs: default_ping_budget(),
            sweep_concurrency: default_sweep_concurrency(),
            refresh_delay_secs: default_refresh_delay(),
            refresh_scope: RefreshScope::default(),
            claim_lease_secs: default_liveness_lease(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            binary: default_nmap_binary(),
            timing_template: default_timing_template(),
            os_concurrency: default_os_concurrency(),
            os_host_timeout_secs: default_os_host_timeout(),
            port_host_timeout_secs: default_port_host_timeout(),
            service_host_timeout_secs: default_service_host_timeout(),
            claim_lease_secs: default_fingerprint_lease(),
            idle_delay_secs: default_idle_delay(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable a procedure
    pub fn validate(&self) -> Result<()> {
        if self.liveness.sweep_concurrency == 0 {
            bail!("liveness.sweep_concurrency must be at least 1");
        }
        if self.fingerprint.os_concurrency == 0 {
            bail!("fingerprint.os_concurrency must be at least 1");
        }
        if self.liveness.time_budget_secs == 0 {
            bail!("liveness.time_budget_secs must be at least 1");
        }
        if self.fingerprint.timing_template > 5 {
            bail!("fingerprint.timing_template must be between 0 and 5");
        }
        if self.fingerprint.os_host_timeout_secs == 0
            || self.fingerprint.port_host_timeout_secs == 0
            || self.fingerprint.service_host_timeout_secs == 0
        {
            bail!("fingerprint host timeouts must be at least 1 second");
        }
        for lease in [self.liveness.claim_lease_secs, self.fingerprint.claim_lease_secs] {
            if lease == 0 || lease > MAX_CLAIM_LEASE_SECS {
                bail!("claim_lease_secs must be between 1 and {MAX_CLAIM_LEASE_SECS}");
            }
        }
        Ok(())
    }
}
