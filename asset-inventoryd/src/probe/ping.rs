use std::net::IpAddr;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use shared::types::Liveness;
use tokio::process::Command;
use crate::config::LivenessConfig;
use crate::error::{CapabilityError, ProbeError};
use crate::probe::{run_with_budget, LivenessObservation, LivenessProber};

/// Liveness prober backed by the system `ping` binary.
pub struct PingProber {
    binary: String,
    count: u32,
    wait_secs: u64,
    budget: Duration,
}

impl PingProber {
    /// Fails when the binary cannot be spawned at all.
    pub async fn new(config: &LivenessConfig) -> Result<Self, CapabilityError> {
        let status = Command::new(&config.binary)
            .arg("-V")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;

        if let Err(e) = status {
            return Err(CapabilityError::Unavailable {
                program: config.binary.clone(),
                reason: e.to_string(),
            });
        }

        tracing::info!("Using {} for liveness probes", config.binary);

        Ok(Self {
            binary: config.binary.clone(),
            count: config.count,
            wait_secs: config.wait_secs,
            budget: Duration::from_secs(config.time_budget_secs),
        })
    }
}

#[async_trait]
impl LivenessProber for PingProber {
    async fn probe(&self, address: IpAddr) -> Result<LivenessObservation, ProbeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(self.wait_secs.to_string())
            .arg(address.to_string());

        let output = run_with_budget(command, &self.binary, self.budget).await?;
        let liveness = if replied(&output.stdout) {
            Liveness::Up
        } else {
            Liveness::Down
        };

        tracing::debug!("Ping {}: {}", address, liveness);

        Ok(LivenessObservation {
            address,
            liveness,
            observed_at: Utc::now(),
        })
    }
}

/// A reply line carries the responder's TTL on every common ping implementation.
fn replied(stdout: &[u8]) -> bool {
    String::from_utf8_lossy(stdout)
        .to_ascii_lowercase()
        .contains("ttl=")
}
