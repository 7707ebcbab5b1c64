pub mod nmap;
pub mod nmap_xml;
pub mod ping;

use std::net::IpAddr;
use std::process::Output;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::types::{HostPatch, Liveness, PortState, ServiceKey, ServicePatch};
use tokio::process::Command;
use crate::error::ProbeError;

/// Result of one liveness probe. An unresponsive target is `Down`, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessObservation {
    pub address: IpAddr,
    pub liveness: Liveness,
    pub observed_at: DateTime<Utc>,
}

impl From<LivenessObservation> for HostPatch {
    fn from(obs: LivenessObservation) -> Self {
        HostPatch {
            liveness: Some(obs.liveness),
            liveness_checked_at: Some(obs.observed_at),
            ..HostPatch::for_address(obs.address)
        }
    }
}

/// Best OS match reported by the fingerprint scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsFingerprint {
    pub address: IpAddr,
    pub os_name: String,
    pub os_vendor: Option<String>,
    pub os_family: Option<String>,
    pub os_generation: Option<String>,
    pub os_accuracy: Option<u8>,
}

impl From<OsFingerprint> for HostPatch {
    fn from(fp: OsFingerprint) -> Self {
        HostPatch {
            os_name: Some(fp.os_name),
            os_vendor: fp.os_vendor,
            os_family: fp.os_family,
            os_generation: fp.os_generation,
            os_accuracy: fp.os_accuracy,
            ..HostPatch::for_address(fp.address)
        }
    }
}

/// One port reported open (or open|filtered) by a port sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortObservation {
    pub key: ServiceKey,
    pub state: PortState,
}

impl From<PortObservation> for ServicePatch {
    fn from(obs: PortObservation) -> Self {
        ServicePatch {
            state: Some(obs.state),
            ..ServicePatch::for_key(obs.key)
        }
    }
}

/// Service fingerprint of one endpoint. Only `key` is set when the host or
/// port no longer responds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFingerprint {
    pub key: ServiceKey,
    pub state: Option<PortState>,
    pub reason: Option<String>,
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl ServiceFingerprint {
    pub fn key_only(key: ServiceKey) -> Self {
        Self {
            key,
            state: None,
            reason: None,
            service_name: None,
            product: None,
            version: None,
            observed_at: None,
        }
    }

    /// True when the scanner learned nothing beyond the key.
    pub fn is_empty(&self) -> bool {
        *self == Self::key_only(self.key)
    }
}

impl From<ServiceFingerprint> for ServicePatch {
    fn from(fp: ServiceFingerprint) -> Self {
        ServicePatch {
            state: fp.state,
            reason: fp.reason,
            service_name: fp.service_name,
            product: fp.product,
            version: fp.version,
            observed_at: fp.observed_at,
            ..ServicePatch::for_key(fp.key)
        }
    }
}

/// Reports whether an address is reachable.
#[async_trait]
pub trait LivenessProber: Send + Sync {
    async fn probe(&self, address: IpAddr) -> Result<LivenessObservation, ProbeError>;
}

/// OS, port and service fingerprinting of a single address.
#[async_trait]
pub trait FingerprintScanner: Send + Sync {
    /// `None` when the host is unreachable or no OS match was found.
    async fn os_fingerprint(&self, address: IpAddr) -> Result<Option<OsFingerprint>, ProbeError>;

    /// Open and open|filtered ports, in scanner order. Empty when the host is
    /// unreachable or nothing is open.
    async fn port_sweep(&self, address: IpAddr) -> Result<Vec<PortObservation>, ProbeError>;

    async fn service_fingerprint(&self, key: ServiceKey) -> Result<ServiceFingerprint, ProbeError>;
}

/// Run an external probe process under a whole-process time budget.
/// The child is killed if the budget runs out.
pub(crate) async fn run_with_budget(
    mut command: Command,
    program: &str,
    budget: Duration,
) -> Result<Output, ProbeError> {
    command.kill_on_drop(true);
    let output = tokio::time::timeout(budget, command.output())
        .await
        .map_err(|_| ProbeError::TimedOut {
            program: program.to_string(),
            budget,
        })?
        .map_err(|source| ProbeError::Spawn {
            program: program.to_string(),
            source,
        })?;
    Ok(output)
}
