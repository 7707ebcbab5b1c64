use std::net::IpAddr;
use std::thread;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use shared::types::{
    HostPatch, HostRecord, Liveness, PortState, ServiceKey, ServicePatch, ServiceRecord,
};
use crate::error::StoreError;
use crate::selector::HostPolicy;
use crate::store::db::{InventoryDb, MergeOutcome};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands sent to the store thread
pub enum StoreCommand {
    GetHost(IpAddr, Reply<Option<HostRecord>>),
    GetService(ServiceKey, Reply<Option<ServiceRecord>>),
    MergeHost(HostPatch, Reply<MergeOutcome>),
    MergeService(ServicePatch, Reply<MergeOutcome>),
    ClaimHost {
        policy: HostPolicy,
        lease: Duration,
        reply: Reply<Option<IpAddr>>,
    },
    ClaimService {
        lease: Duration,
        reply: Reply<Option<ServiceKey>>,
    },
    Hosts(Option<Liveness>, Reply<Vec<HostRecord>>),
    Services {
        address: Option<IpAddr>,
        state: Option<PortState>,
        reply: Reply<Vec<ServiceRecord>>,
    },
    Shutdown,
}

/// Handle to the record store.
///
/// The SQLite connection lives on a dedicated thread; every clone of the
/// handle talks to that thread, so all merge-writes of one process are
/// serialized.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread owning `db`
    pub fn spawn(db: InventoryDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::GetHost(address, reply) => {
                        let _ = reply.send(db.get_host(address));
                    }
                    StoreCommand::GetService(key, reply) => {
                        let _ = reply.send(db.get_service(key));
                    }
                    StoreCommand::MergeHost(patch, reply) => {
                        let result = db.merge_host(patch);
                        if let Err(e) = &result {
                            tracing::error!("Host merge failed: {}", e);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::MergeService(patch, reply) => {
                        let result = db.merge_service(patch);
                        if let Err(e) = &result {
                            tracing::error!("Service merge failed: {}", e);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::ClaimHost { policy, lease, reply } => {
                        let now = Utc::now();
                        let result = lease_until(now, lease)
                            .and_then(|until| db.claim_host(policy, now, until));
                        let _ = reply.send(result);
                    }
                    StoreCommand::ClaimService { lease, reply } => {
                        let now = Utc::now();
                        let result = lease_until(now, lease)
                            .and_then(|until| db.claim_service(now, until));
                        let _ = reply.send(result);
                    }
                    StoreCommand::Hosts(liveness, reply) => {
                        let _ = reply.send(db.hosts(liveness));
                    }
                    StoreCommand::Services { address, state, reply } => {
                        let _ = reply.send(db.services(address, state));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn get_host(&self, address: IpAddr) -> Result<Option<HostRecord>, StoreError> {
        self.request(|reply| StoreCommand::GetHost(address, reply)).await
    }

    pub async fn get_service(&self, key: ServiceKey) -> Result<Option<ServiceRecord>, StoreError> {
        self.request(|reply| StoreCommand::GetService(key, reply)).await
    }

    /// Apply a host patch through the reconciler
    pub async fn merge_host(&self, patch: HostPatch) -> Result<MergeOutcome, StoreError> {
        self.request(|reply| StoreCommand::MergeHost(patch, reply)).await
    }

    /// Apply a service patch through the reconciler
    pub async fn merge_service(&self, patch: ServicePatch) -> Result<MergeOutcome, StoreError> {
        self.request(|reply| StoreCommand::MergeService(patch, reply)).await
    }

    pub async fn claim_host(
        &self,
        policy: HostPolicy,
        lease: Duration,
    ) -> Result<Option<IpAddr>, StoreError> {
        self.request(|reply| StoreCommand::ClaimHost { policy, lease, reply })
            .await
    }

    pub async fn claim_service(&self, lease: Duration) -> Result<Option<ServiceKey>, StoreError> {
        self.request(|reply| StoreCommand::ClaimService { lease, reply })
            .await
    }

    pub async fn hosts(&self, liveness: Option<Liveness>) -> Result<Vec<HostRecord>, StoreError> {
        self.request(|reply| StoreCommand::Hosts(liveness, reply)).await
    }

    pub async fn services(
        &self,
        address: Option<IpAddr>,
        state: Option<PortState>,
    ) -> Result<Vec<ServiceRecord>, StoreError> {
        self.request(|reply| StoreCommand::Services { address, state, reply })
            .await
    }

    /// Stop the store thread; the connection is closed when the thread exits
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| StoreError::Closed)
    }
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or(StoreError::LeaseOutOfRange { lease })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::Protocol;

    fn memory_store() -> StoreHandle {
        StoreHandle::spawn(InventoryDb::open(":memory:").unwrap())
    }

    #[tokio::test]
    async fn test_merge_through_handle() {
        let store = memory_store();
        let address: IpAddr = "10.0.0.7".parse().unwrap();

        let outcome = store
            .merge_host(HostPatch {
                liveness: Some(Liveness::Up),
                ..HostPatch::for_address(address)
            })
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Created);

        let host = store.get_host(address).await.unwrap().unwrap();
        assert_eq!(host.liveness, Some(Liveness::Up));
    }

    #[tokio::test]
    async fn test_claim_lease_is_in_the_future() {
        let store = memory_store();
        let key = ServiceKey::new("10.0.0.7".parse().unwrap(), 443, Protocol::Tcp);
        store
            .merge_service(ServicePatch {
                state: Some(PortState::Open),
                ..ServicePatch::for_key(key)
            })
            .await
            .unwrap();

        let claimed = store.claim_service(Duration::from_secs(600)).await.unwrap();
        assert_eq!(claimed, Some(key));

        let record = store.get_service(key).await.unwrap().unwrap();
        assert!(record.observed_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_oversized_lease_is_rejected_and_store_survives() {
        let store = memory_store();
        let key = ServiceKey::new("10.0.0.7".parse().unwrap(), 22, Protocol::Tcp);
        store
            .merge_service(ServicePatch {
                state: Some(PortState::Open),
                ..ServicePatch::for_key(key)
            })
            .await
            .unwrap();

        let huge = Duration::from_secs(10_000_000_000_000);
        let err = store.claim_service(huge).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseOutOfRange { .. }));
        let err = store
            .claim_host(HostPolicy::StalestLiveness, huge)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseOutOfRange { .. }));

        // the key was not claimed and the store thread is still serving
        let record = store.get_service(key).await.unwrap().unwrap();
        assert_eq!(record.observed_at, None);
        assert_eq!(store.hosts(None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let store = memory_store();
        store.shutdown().await.unwrap();

        let err = store.hosts(None).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
