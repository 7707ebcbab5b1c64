use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use shared::types::{HostPatch, Liveness, ServiceKey, ServicePatch};
use tokio_util::sync::CancellationToken;
use crate::config::{FingerprintConfig, LivenessConfig, RefreshScope};
use crate::dispatch::{
    dispatch_batch, reconcile_batch, run_continuous, BatchReport, LoopStats, Pacing,
    RefreshPolicy, Step,
};
use crate::error::{ProbeError, StoreError};
use crate::probe::{
    FingerprintScanner, LivenessObservation, LivenessProber, OsFingerprint, PortObservation,
    ServiceFingerprint,
};
use crate::selector::{HostPolicy, WorkSelector};
use crate::store::db::MergeOutcome;
use crate::store_manager::StoreHandle;

/// Ping every address once and record the result.
pub async fn sweep_liveness(
    store: &StoreHandle,
    prober: &dyn LivenessProber,
    addresses: Vec<IpAddr>,
    concurrency: usize,
) -> Result<BatchReport, StoreError> {
    let results = dispatch_batch(addresses, concurrency, |address| prober.probe(address)).await;

    reconcile_batch(results, |observation: LivenessObservation| async move {
        tracing::debug!("{} is {}", observation.address, observation.liveness);
        store.merge_host(observation.into()).await.map(|_| true)
    })
    .await
}

/// OS-fingerprint every host currently marked up.
pub async fn sweep_os(
    store: &StoreHandle,
    scanner: &dyn FingerprintScanner,
    concurrency: usize,
) -> Result<BatchReport, StoreError> {
    let addresses: Vec<IpAddr> = store
        .hosts(Some(Liveness::Up))
        .await?
        .into_iter()
        .map(|host| host.address)
        .collect();

    if addresses.is_empty() {
        tracing::info!("No hosts are up, nothing to fingerprint");
    }

    let results =
        dispatch_batch(addresses, concurrency, |address| scanner.os_fingerprint(address)).await;

    reconcile_batch(results, |fingerprint: Option<OsFingerprint>| async move {
        match fingerprint {
            Some(fingerprint) => {
                tracing::debug!("{} runs {}", fingerprint.address, fingerprint.os_name);
                store.merge_host(fingerprint.into()).await.map(|_| true)
            }
            None => Ok(false),
        }
    })
    .await
}

/// Continuously re-ping the host with the stalest liveness timestamp.
pub async fn refresh_liveness(
    store: StoreHandle,
    prober: Arc<dyn LivenessProber>,
    config: &LivenessConfig,
    cancel: &CancellationToken,
) -> Result<LoopStats, StoreError> {
    let policy = match config.refresh_scope {
        RefreshScope::All => HostPolicy::StalestLiveness,
        RefreshScope::Up => HostPolicy::StalestLivenessUp,
    };
    let selector = WorkSelector::new(store.clone(), Duration::from_secs(config.claim_lease_secs));
    let steps: Vec<Box<dyn Step>> = vec![Box::new(LivenessRefresh {
        store,
        selector,
        policy,
        prober,
    })];

    let delay = Duration::from_secs(config.refresh_delay_secs);
    run_continuous(&steps, Pacing { delay, idle: delay }, cancel).await
}

/// Continuously alternate a port sweep of the up-host scanned longest ago
/// with a service fingerprint of the stalest open service.
pub async fn refresh_services(
    store: StoreHandle,
    scanner: Arc<dyn FingerprintScanner>,
    config: &FingerprintConfig,
    cancel: &CancellationToken,
) -> Result<LoopStats, StoreError> {
    let selector = WorkSelector::new(store.clone(), Duration::from_secs(config.claim_lease_secs));
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(PortDiscovery {
            store: store.clone(),
            selector: selector.clone(),
            scanner: scanner.clone(),
        }),
        Box::new(ServiceFingerprinting {
            store,
            selector,
            scanner,
        }),
    ];

    let pacing = Pacing {
        delay: Duration::ZERO,
        idle: Duration::from_secs(config.idle_delay_secs),
    };
    run_continuous(&steps, pacing, cancel).await
}

struct LivenessRefresh {
    store: StoreHandle,
    selector: WorkSelector,
    policy: HostPolicy,
    prober: Arc<dyn LivenessProber>,
}

#[async_trait]
impl RefreshPolicy for LivenessRefresh {
    type Key = IpAddr;
    type Observation = LivenessObservation;

    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn claim(&self) -> Result<Option<IpAddr>, StoreError> {
        self.selector.next_host(self.policy).await
    }

    async fn probe(&self, address: &IpAddr) -> Result<LivenessObservation, ProbeError> {
        self.prober.probe(*address).await
    }

    async fn reconcile(
        &self,
        address: &IpAddr,
        observation: LivenessObservation,
    ) -> Result<(), StoreError> {
        tracing::info!("{} is {}", address, observation.liveness);
        self.store.merge_host(observation.into()).await?;
        Ok(())
    }
}

struct PortDiscovery {
    store: StoreHandle,
    selector: WorkSelector,
    scanner: Arc<dyn FingerprintScanner>,
}

#[async_trait]
impl RefreshPolicy for PortDiscovery {
    type Key = IpAddr;
    type Observation = Vec<PortObservation>;

    fn name(&self) -> &'static str {
        "port discovery"
    }

    async fn claim(&self) -> Result<Option<IpAddr>, StoreError> {
        self.selector.next_host(HostPolicy::StalestPortScanUp).await
    }

    async fn probe(&self, address: &IpAddr) -> Result<Vec<PortObservation>, ProbeError> {
        self.scanner.port_sweep(*address).await
    }

    async fn reconcile(
        &self,
        address: &IpAddr,
        ports: Vec<PortObservation>,
    ) -> Result<(), StoreError> {
        tracing::info!("{}: {} open ports", address, ports.len());
        for port in ports {
            self.store.merge_service(port.into()).await?;
        }

        // Stamped even when nothing answered so the host rotates to the back.
        self.store
            .merge_host(HostPatch {
                ports_checked_at: Some(Utc::now()),
                ..HostPatch::for_address(*address)
            })
            .await?;
        Ok(())
    }
}

struct ServiceFingerprinting {
    store: StoreHandle,
    selector: WorkSelector,
    scanner: Arc<dyn FingerprintScanner>,
}

#[async_trait]
impl RefreshPolicy for ServiceFingerprinting {
    type Key = ServiceKey;
    type Observation = ServiceFingerprint;

    fn name(&self) -> &'static str {
        "service fingerprinting"
    }

    async fn claim(&self) -> Result<Option<ServiceKey>, StoreError> {
        self.selector.next_service().await
    }

    async fn probe(&self, key: &ServiceKey) -> Result<ServiceFingerprint, ProbeError> {
        self.scanner.service_fingerprint(*key).await
    }

    async fn reconcile(
        &self,
        key: &ServiceKey,
        fingerprint: ServiceFingerprint,
    ) -> Result<(), StoreError> {
        if fingerprint.is_empty() {
            tracing::info!("{} did not respond, skipped until its claim expires", key);
            return Ok(());
        }

        let mut patch = ServicePatch::from(fingerprint);
        patch.observed_at.get_or_insert_with(Utc::now);
        tracing::info!(
            "{}: {}",
            key,
            patch.service_name.as_deref().unwrap_or("unidentified")
        );
        self.store.merge_service(patch).await?;
        Ok(())
    }
}

/// Operator-maintained fields. `name` applies to hosts only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    pub name: Option<String>,
    pub department: Option<String>,
    pub admin: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationTarget {
    Host(IpAddr),
    Service(ServiceKey),
}

/// Record operator metadata through the same merge path as probe results.
pub async fn annotate(
    store: &StoreHandle,
    target: AnnotationTarget,
    annotation: Annotation,
) -> Result<MergeOutcome, StoreError> {
    match target {
        AnnotationTarget::Host(address) => {
            store
                .merge_host(HostPatch {
                    name: annotation.name,
                    department: annotation.department,
                    admin: annotation.admin,
                    description: annotation.description,
                    ..HostPatch::for_address(address)
                })
                .await
        }
        AnnotationTarget::Service(key) => {
            if annotation.name.is_some() {
                tracing::warn!("Ignoring name for service {}", key);
            }
            store
                .merge_service(ServicePatch {
                    department: annotation.department,
                    admin: annotation.admin,
                    description: annotation.description,
                    ..ServicePatch::for_key(key)
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use chrono::DateTime;
    use shared::types::{PortState, Protocol};
    use crate::dispatch::StepOutcome;
    use crate::store::db::InventoryDb;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn memory_store() -> StoreHandle {
        StoreHandle::spawn(InventoryDb::open(":memory:").unwrap())
    }

    #[derive(Default)]
    struct FakeProber {
        up: HashSet<IpAddr>,
        failing: HashSet<IpAddr>,
        calls: Mutex<Vec<IpAddr>>,
    }

    #[async_trait]
    impl LivenessProber for FakeProber {
        async fn probe(&self, address: IpAddr) -> Result<LivenessObservation, ProbeError> {
            self.calls.lock().unwrap().push(address);
            if self.failing.contains(&address) {
                return Err(ProbeError::Spawn {
                    program: "ping".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "fork failed"),
                });
            }
            let liveness = if self.up.contains(&address) {
                Liveness::Up
            } else {
                Liveness::Down
            };
            Ok(LivenessObservation {
                address,
                liveness,
                observed_at: Utc::now(),
            })
        }
    }

    #[derive(Default)]
    struct FakeScanner {
        os: HashMap<IpAddr, OsFingerprint>,
        ports: HashMap<IpAddr, Vec<PortObservation>>,
        services: HashMap<ServiceKey, ServiceFingerprint>,
        failing: HashSet<IpAddr>,
    }

    impl FakeScanner {
        fn check(&self, address: IpAddr) -> Result<(), ProbeError> {
            if self.failing.contains(&address) {
                Err(ProbeError::MalformedOutput("no nmaprun element".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl FingerprintScanner for FakeScanner {
        async fn os_fingerprint(
            &self,
            address: IpAddr,
        ) -> Result<Option<OsFingerprint>, ProbeError> {
            self.check(address)?;
            Ok(self.os.get(&address).cloned())
        }

        async fn port_sweep(&self, address: IpAddr) -> Result<Vec<PortObservation>, ProbeError> {
            self.check(address)?;
            Ok(self.ports.get(&address).cloned().unwrap_or_default())
        }

        async fn service_fingerprint(
            &self,
            key: ServiceKey,
        ) -> Result<ServiceFingerprint, ProbeError> {
            self.check(key.address)?;
            Ok(self
                .services
                .get(&key)
                .cloned()
                .unwrap_or_else(|| ServiceFingerprint::key_only(key)))
        }
    }

    async fn seed_host(store: &StoreHandle, address: &str, liveness: Liveness) {
        store
            .merge_host(HostPatch {
                liveness: Some(liveness),
                ..HostPatch::for_address(ip(address))
            })
            .await
            .unwrap();
    }

    fn selector(store: &StoreHandle) -> WorkSelector {
        WorkSelector::new(store.clone(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_liveness_sweep_survives_a_failed_probe() {
        let store = memory_store();
        let prober = FakeProber {
            up: [ip("10.0.0.1"), ip("10.0.0.4")].into(),
            failing: [ip("10.0.0.3")].into(),
            ..FakeProber::default()
        };
        let addresses = vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3"), ip("10.0.0.4")];

        let report = sweep_liveness(&store, &prober, addresses, 240).await.unwrap();
        assert_eq!(report.submitted, 4);
        assert_eq!(report.reconciled, 3);
        assert_eq!(report.failed, 1);

        let hosts = store.hosts(None).await.unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(store.hosts(Some(Liveness::Up)).await.unwrap().len(), 2);
        assert!(store.get_host(ip("10.0.0.3")).await.unwrap().is_none());
        assert!(hosts.iter().all(|h| h.liveness_checked_at.is_some() && h.os_name.is_none()));
    }

    #[tokio::test]
    async fn test_os_sweep_keeps_liveness_fields() {
        let store = memory_store();
        let checked_at = DateTime::from_timestamp(100, 0);
        for address in ["10.0.0.1", "10.0.0.2"] {
            store
                .merge_host(HostPatch {
                    liveness: Some(Liveness::Up),
                    liveness_checked_at: checked_at,
                    ..HostPatch::for_address(ip(address))
                })
                .await
                .unwrap();
        }
        seed_host(&store, "10.0.0.3", Liveness::Down).await;

        let fingerprint = OsFingerprint {
            address: ip("10.0.0.1"),
            os_name: "Linux 3.x".to_string(),
            os_vendor: Some("Linux".to_string()),
            os_family: Some("Linux".to_string()),
            os_generation: Some("3.X".to_string()),
            os_accuracy: Some(95),
        };
        let scanner = FakeScanner {
            os: [(ip("10.0.0.1"), fingerprint)].into(),
            ..FakeScanner::default()
        };

        let report = sweep_os(&store, &scanner, 10).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.empty, 1);

        let host = store.get_host(ip("10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(host.liveness, Some(Liveness::Up));
        assert_eq!(host.liveness_checked_at, checked_at);
        assert_eq!(host.os_name.as_deref(), Some("Linux 3.x"));
        assert_eq!(host.os_accuracy, Some(95));

        let untouched = store.get_host(ip("10.0.0.2")).await.unwrap().unwrap();
        assert_eq!(untouched.os_name, None);
    }

    #[tokio::test]
    async fn test_port_discovery_creates_state_only_services() {
        let store = memory_store();
        seed_host(&store, "10.0.0.2", Liveness::Up).await;

        let open = |port| PortObservation {
            key: ServiceKey::new(ip("10.0.0.2"), port, Protocol::Tcp),
            state: PortState::Open,
        };
        let scanner = Arc::new(FakeScanner {
            ports: [(ip("10.0.0.2"), vec![open(80), open(22)])].into(),
            ..FakeScanner::default()
        });
        let step = PortDiscovery {
            store: store.clone(),
            selector: selector(&store),
            scanner,
        };

        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);

        let services = store.services(None, None).await.unwrap();
        assert_eq!(services.len(), 2);
        for port in [22, 80] {
            let key = ServiceKey::new(ip("10.0.0.2"), port, Protocol::Tcp);
            let record = store.get_service(key).await.unwrap().unwrap();
            assert_eq!(
                record,
                shared::types::ServiceRecord {
                    state: Some(PortState::Open),
                    ..shared::types::ServiceRecord::empty(key)
                }
            );
        }

        let host = store.get_host(ip("10.0.0.2")).await.unwrap().unwrap();
        assert!(host.ports_checked_at.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn test_port_discovery_stamps_hosts_with_nothing_open() {
        let store = memory_store();
        seed_host(&store, "10.0.0.5", Liveness::Up).await;
        seed_host(&store, "10.0.0.6", Liveness::Up).await;

        let step = PortDiscovery {
            store: store.clone(),
            selector: selector(&store),
            scanner: Arc::new(FakeScanner::default()),
        };

        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);
        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);
        assert!(store.services(None, None).await.unwrap().is_empty());
        for address in ["10.0.0.5", "10.0.0.6"] {
            let host = store.get_host(ip(address)).await.unwrap().unwrap();
            assert!(host.ports_checked_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_liveness_refresh_moves_past_a_failing_host() {
        let store = memory_store();
        seed_host(&store, "10.0.0.1", Liveness::Up).await;
        seed_host(&store, "10.0.0.2", Liveness::Up).await;

        let prober = Arc::new(FakeProber {
            failing: [ip("10.0.0.1")].into(),
            ..FakeProber::default()
        });
        let step = LivenessRefresh {
            store: store.clone(),
            selector: selector(&store),
            policy: HostPolicy::StalestLiveness,
            prober: prober.clone(),
        };

        assert_eq!(step.step().await.unwrap(), StepOutcome::ProbeFailed);
        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);
        assert_eq!(*prober.calls.lock().unwrap(), vec![ip("10.0.0.1"), ip("10.0.0.2")]);

        let failed = store.get_host(ip("10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(failed.liveness, Some(Liveness::Up));
        let refreshed = store.get_host(ip("10.0.0.2")).await.unwrap().unwrap();
        assert_eq!(refreshed.liveness, Some(Liveness::Down));
    }

    #[tokio::test]
    async fn test_service_fingerprint_merges_and_key_only_is_skipped() {
        let store = memory_store();
        let web = ServiceKey::new(ip("10.0.0.2"), 80, Protocol::Tcp);
        let gone = ServiceKey::new(ip("10.0.0.2"), 8443, Protocol::Tcp);
        for key in [web, gone] {
            store
                .merge_service(ServicePatch {
                    state: Some(PortState::Open),
                    department: Some("Facilities".to_string()),
                    ..ServicePatch::for_key(key)
                })
                .await
                .unwrap();
        }

        let scanner = Arc::new(FakeScanner {
            services: [(
                web,
                ServiceFingerprint {
                    state: Some(PortState::Open),
                    reason: Some("syn-ack".to_string()),
                    service_name: Some("http".to_string()),
                    product: Some("nginx".to_string()),
                    version: Some("1.24.0".to_string()),
                    observed_at: DateTime::from_timestamp(1_700_000_000, 0),
                    ..ServiceFingerprint::key_only(web)
                },
            )]
            .into(),
            ..FakeScanner::default()
        });
        let step = ServiceFingerprinting {
            store: store.clone(),
            selector: selector(&store),
            scanner,
        };

        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);
        assert_eq!(step.step().await.unwrap(), StepOutcome::Refreshed);

        let record = store.get_service(web).await.unwrap().unwrap();
        assert_eq!(record.product.as_deref(), Some("nginx"));
        assert_eq!(record.department.as_deref(), Some("Facilities"));
        assert_eq!(record.observed_at, DateTime::from_timestamp(1_700_000_000, 0));

        let record = store.get_service(gone).await.unwrap().unwrap();
        assert_eq!(record.service_name, None);
        assert!(record.observed_at.unwrap() > Utc::now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_liveness_runs_until_cancelled() {
        let store = memory_store();
        seed_host(&store, "10.0.0.1", Liveness::Down).await;

        let prober = Arc::new(FakeProber {
            up: [ip("10.0.0.1")].into(),
            ..FakeProber::default()
        });
        let config = LivenessConfig {
            refresh_delay_secs: 0,
            ..LivenessConfig::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let stats = refresh_liveness(store.clone(), prober, &config, &cancel)
            .await
            .unwrap();
        assert!(stats.refreshed >= 1);

        let host = store.get_host(ip("10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(host.liveness, Some(Liveness::Up));
    }

    #[tokio::test]
    async fn test_annotate_host_and_service() {
        let store = memory_store();
        seed_host(&store, "10.0.0.9", Liveness::Up).await;

        let outcome = annotate(
            &store,
            AnnotationTarget::Host(ip("10.0.0.9")),
            Annotation {
                name: Some("badge-reader".to_string()),
                department: Some("Security".to_string()),
                ..Annotation::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, MergeOutcome::Updated);

        let host = store.get_host(ip("10.0.0.9")).await.unwrap().unwrap();
        assert_eq!(host.name.as_deref(), Some("badge-reader"));
        assert_eq!(host.department.as_deref(), Some("Security"));
        assert_eq!(host.liveness, Some(Liveness::Up));

        let key = ServiceKey::new(ip("10.0.0.9"), 443, Protocol::Tcp);
        let outcome = annotate(
            &store,
            AnnotationTarget::Service(key),
            Annotation {
                admin: Some("ops@example.org".to_string()),
                ..Annotation::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, MergeOutcome::Created);

        let record = store.get_service(key).await.unwrap().unwrap();
        assert_eq!(record.admin.as_deref(), Some("ops@example.org"));
        assert_eq!(record.state, None);
    }
}
