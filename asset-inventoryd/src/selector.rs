use std::net::IpAddr;
use std::time::Duration;
use shared::types::ServiceKey;
use crate::error::StoreError;
use crate::store_manager::StoreHandle;

/// Oldest-first selection policies over the host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPolicy {
    /// Stalest liveness timestamp over every host
    StalestLiveness,
    /// Stalest liveness timestamp over hosts currently up
    StalestLivenessUp,
    /// Stalest port-scan timestamp over hosts currently up
    StalestPortScanUp,
}

impl HostPolicy {
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            HostPolicy::StalestLiveness | HostPolicy::StalestLivenessUp => "liveness_checked_at",
            HostPolicy::StalestPortScanUp => "ports_checked_at",
        }
    }

    pub fn only_up(&self) -> bool {
        !matches!(self, HostPolicy::StalestLiveness)
    }
}

/// Hands out the next key to probe for continuous refresh.
///
/// Every selection is a claim: the chosen key's timestamp is pushed `lease`
/// into the future before the key is returned, so a concurrent selection
/// against the same policy moves on to the next stalest key. A probe that
/// completes overwrites the lease with its observation time; a probe that
/// fails leaves it to expire.
#[derive(Clone)]
pub struct WorkSelector {
    store: StoreHandle,
    lease: Duration,
}

impl WorkSelector {
    pub fn new(store: StoreHandle, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub async fn next_host(&self, policy: HostPolicy) -> Result<Option<IpAddr>, StoreError> {
        self.store.claim_host(policy, self.lease).await
    }

    /// Stalest service currently open.
    pub async fn next_service(&self) -> Result<Option<ServiceKey>, StoreError> {
        self.store.claim_service(self.lease).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{HostPatch, Liveness, PortState, Protocol, ServicePatch};
    use crate::store::db::InventoryDb;

    fn selector() -> (StoreHandle, WorkSelector) {
        let store = StoreHandle::spawn(InventoryDb::open(":memory:").unwrap());
        let selector = WorkSelector::new(store.clone(), Duration::from_secs(3600));
        (store, selector)
    }

    #[tokio::test]
    async fn test_concurrent_selections_do_not_share_a_key() {
        let (store, selector) = selector();
        for port in [22, 80] {
            let key = ServiceKey::new("10.0.0.2".parse().unwrap(), port, Protocol::Tcp);
            store
                .merge_service(ServicePatch {
                    state: Some(PortState::Open),
                    ..ServicePatch::for_key(key)
                })
                .await
                .unwrap();
        }

        let other = selector.clone();
        let (first, second) = tokio::join!(selector.next_service(), other.next_service());
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_selection_order_is_oldest_first() {
        let (store, selector) = selector();
        let stamps = [("10.0.0.1", 400), ("10.0.0.2", 100), ("10.0.0.3", 300), ("10.0.0.4", 200)];
        for (address, secs) in stamps {
            store
                .merge_host(HostPatch {
                    liveness: Some(Liveness::Up),
                    liveness_checked_at: chrono::DateTime::from_timestamp(secs, 0),
                    ..HostPatch::for_address(address.parse().unwrap())
                })
                .await
                .unwrap();
        }

        let mut selected = Vec::new();
        while let Some(address) = selector.next_host(HostPolicy::StalestLivenessUp).await.unwrap() {
            selected.push(address);
        }

        let order: Vec<i64> = selected
            .iter()
            .map(|a| stamps.iter().find(|(s, _)| a.to_string() == *s).unwrap().1)
            .collect();
        assert_eq!(order, vec![100, 200, 300, 400]);
    }
}
