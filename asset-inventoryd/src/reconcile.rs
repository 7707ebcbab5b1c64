use shared::types::{HostPatch, HostRecord, ServicePatch, ServiceRecord};

/// Merge a host patch into the existing record (if any).
///
/// Fields set on the patch replace stored ones; unset fields keep what was
/// stored. `None` when the patch carries no address.
pub fn merge_host(existing: Option<HostRecord>, patch: HostPatch) -> Option<HostRecord> {
    let address = patch.address?;
    let base = existing
        .filter(|record| record.address == address)
        .unwrap_or_else(|| HostRecord::empty(address));

    Some(HostRecord {
        address,
        name: patch.name.or(base.name),
        liveness: patch.liveness.or(base.liveness),
        os_name: patch.os_name.or(base.os_name),
        os_vendor: patch.os_vendor.or(base.os_vendor),
        os_family: patch.os_family.or(base.os_family),
        os_generation: patch.os_generation.or(base.os_generation),
        os_accuracy: patch.os_accuracy.or(base.os_accuracy),
        department: patch.department.or(base.department),
        admin: patch.admin.or(base.admin),
        liveness_checked_at: patch.liveness_checked_at.or(base.liveness_checked_at),
        ports_checked_at: patch.ports_checked_at.or(base.ports_checked_at),
        description: patch.description.or(base.description),
    })
}

/// Merge a service patch into the existing record (if any).
pub fn merge_service(existing: Option<ServiceRecord>, patch: ServicePatch) -> Option<ServiceRecord> {
    let key = patch.key()?;
    let base = existing
        .filter(|record| record.key() == key)
        .unwrap_or_else(|| ServiceRecord::empty(key));

    Some(ServiceRecord {
        address: key.address,
        port: key.port,
        protocol: key.protocol,
        state: patch.state.or(base.state),
        reason: patch.reason.or(base.reason),
        service_name: patch.service_name.or(base.service_name),
        product: patch.product.or(base.product),
        version: patch.version.or(base.version),
        department: patch.department.or(base.department),
        admin: patch.admin.or(base.admin),
        observed_at: patch.observed_at.or(base.observed_at),
        description: patch.description.or(base.description),
    })
}
