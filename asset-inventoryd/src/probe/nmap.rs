use std::net::IpAddr;
use std::time::Duration;
use async_trait::async_trait;
use shared::types::{Protocol, ServiceKey};
use tokio::process::Command;
use crate::config::FingerprintConfig;
use crate::error::{CapabilityError, ProbeError};
use crate::probe::{
    nmap_xml, run_with_budget, FingerprintScanner, OsFingerprint, PortObservation,
    ServiceFingerprint,
};

/// Extra wall-clock allowance on top of nmap's own --host-timeout
const BUDGET_GRACE: Duration = Duration::from_secs(30);

/// Fingerprint scanner driving the `nmap` binary with XML output.
pub struct NmapScanner {
    binary: String,
    timing: u8,
    os_host_timeout: Duration,
    port_host_timeout: Duration,
    service_host_timeout: Duration,
}

impl NmapScanner {
    /// Runs `nmap -V` and checks it identifies itself.
    pub async fn new(config: &FingerprintConfig) -> Result<Self, CapabilityError> {
        let unavailable = |reason: String| CapabilityError::Unavailable {
            program: config.binary.clone(),
            reason,
        };

        let output = Command::new(&config.binary)
            .arg("-V")
            .output()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let banner = String::from_utf8_lossy(&output.stdout);
        if !banner.contains("Nmap version") {
            return Err(unavailable("unexpected version banner".to_string()));
        }

        if let Some(line) = banner.lines().next() {
            tracing::info!("Using {}", line.trim());
        }

        Ok(Self {
            binary: config.binary.clone(),
            timing: config.timing_template,
            os_host_timeout: Duration::from_secs(config.os_host_timeout_secs),
            port_host_timeout: Duration::from_secs(config.port_host_timeout_secs),
            service_host_timeout: Duration::from_secs(config.service_host_timeout_secs),
        })
    }

    async fn run(&self, args: Vec<String>, host_timeout: Duration) -> Result<String, ProbeError> {
        let mut command = Command::new(&self.binary);
        command
            .args(["-oX", "-", "-Pn"])
            .args(&args)
            .arg("--host-timeout")
            .arg(format!("{}s", host_timeout.as_secs()));

        tracing::debug!("Running {} {}", self.binary, args.join(" "));

        let output = run_with_budget(command, &self.binary, host_timeout + BUDGET_GRACE).await?;
        String::from_utf8(output.stdout)
            .map_err(|_| ProbeError::MalformedOutput("scanner output is not UTF-8".to_string()))
    }
}

#[async_trait]
impl FingerprintScanner for NmapScanner {
    async fn os_fingerprint(&self, address: IpAddr) -> Result<Option<OsFingerprint>, ProbeError> {
        let args = vec!["-O".to_string(), "--osscan-limit".to_string(), address.to_string()];
        let xml = self.run(with_family(args, address), self.os_host_timeout).await?;
        nmap_xml::parse_os(&xml, address)
    }

    async fn port_sweep(&self, address: IpAddr) -> Result<Vec<PortObservation>, ProbeError> {
        let args = vec![
            "-p".to_string(),
            "1-65535".to_string(),
            "-sS".to_string(),
            format!("-T{}", self.timing),
            address.to_string(),
        ];
        let xml = self.run(with_family(args, address), self.port_host_timeout).await?;
        nmap_xml::parse_ports(&xml, address)
    }

    async fn service_fingerprint(&self, key: ServiceKey) -> Result<ServiceFingerprint, ProbeError> {
        let mut args = vec!["-p".to_string(), key.port.to_string()];
        match key.protocol {
            Protocol::Tcp => {}
            Protocol::Udp => args.push("-sU".to_string()),
            Protocol::Sctp => args.push("-sY".to_string()),
        }
        args.extend([
            format!("-T{}", self.timing),
            "-sV".to_string(),
            "--version-light".to_string(),
            key.address.to_string(),
        ]);

        let xml = self
            .run(with_family(args, key.address), self.service_host_timeout)
            .await?;
        nmap_xml::parse_service(&xml, key)
    }
}

fn with_family(mut args: Vec<String>, address: IpAddr) -> Vec<String> {
    if address.is_ipv6() {
        args.insert(0, "-6".to_string());
    }
    args
}
