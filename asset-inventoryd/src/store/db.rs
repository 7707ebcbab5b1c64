use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use shared::types::{
    HostPatch, HostRecord, Liveness, PortState, Protocol, ServiceKey, ServicePatch, ServiceRecord,
};
use crate::error::StoreError;
use crate::reconcile;
use crate::selector::HostPolicy;

const HOST_COLUMNS: &str = "address, name, liveness, os_name, os_vendor, os_family, os_generation,
    os_accuracy, department, admin, liveness_checked_at, ports_checked_at, description";

const SERVICE_COLUMNS: &str = "address, port, protocol, state, reason, service_name, product,
    version, department, admin, observed_at, description";

/// Result of applying a patch through the merge-write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    /// The merged record equals the stored one; nothing was written.
    Unchanged,
    /// The patch had an incomplete key; nothing was written.
    Rejected,
}

pub struct InventoryDb {
    conn: Connection,
}

impl InventoryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the API and the refresh procedures read while one of them writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS host (
                address             TEXT PRIMARY KEY,
                name                TEXT,
                liveness            TEXT,
                os_name             TEXT,
                os_vendor           TEXT,
                os_family           TEXT,
                os_generation       TEXT,
                os_accuracy         INTEGER,
                department          TEXT,
                admin               TEXT,
                liveness_checked_at INTEGER,
                ports_checked_at    INTEGER,
                description         TEXT
            );

            CREATE TABLE IF NOT EXISTS service (
                address      TEXT NOT NULL,
                port         INTEGER NOT NULL,
                protocol     TEXT NOT NULL,
                state        TEXT,
                reason       TEXT,
                service_name TEXT,
                product      TEXT,
                version      TEXT,
                department   TEXT,
                admin        TEXT,
                observed_at  INTEGER,
                description  TEXT,
                PRIMARY KEY (address, port, protocol)
            );

            CREATE INDEX IF NOT EXISTS idx_host_liveness_checked ON host(liveness, liveness_checked_at);
            CREATE INDEX IF NOT EXISTS idx_host_ports_checked ON host(liveness, ports_checked_at);
            CREATE INDEX IF NOT EXISTS idx_service_state_observed ON service(state, observed_at);
            "#,
        )?;

        Ok(Self { conn })
    }

    pub fn get_host(&self, address: IpAddr) -> Result<Option<HostRecord>, StoreError> {
        Ok(query_host(&self.conn, address)?)
    }

    pub fn get_service(&self, key: ServiceKey) -> Result<Option<ServiceRecord>, StoreError> {
        Ok(query_service(&self.conn, key)?)
    }

    /// Fold a host patch into the stored record, creating it if absent.
    pub fn merge_host(&self, patch: HostPatch) -> Result<MergeOutcome, StoreError> {
        let Some(address) = patch.address else {
            return Ok(MergeOutcome::Rejected);
        };

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing = query_host(&tx, address)?;
        let created = existing.is_none();

        let Some(merged) = reconcile::merge_host(existing.clone(), patch) else {
            return Ok(MergeOutcome::Rejected);
        };
        if existing.as_ref() == Some(&merged) {
            return Ok(MergeOutcome::Unchanged);
        }

        tx.execute(
            &format!(
                "INSERT INTO host ({HOST_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(address) DO UPDATE SET
                    name = excluded.name,
                    liveness = excluded.liveness,
                    os_name = excluded.os_name,
                    os_vendor = excluded.os_vendor,
                    os_family = excluded.os_family,
                    os_generation = excluded.os_generation,
                    os_accuracy = excluded.os_accuracy,
                    department = excluded.department,
                    admin = excluded.admin,
                    liveness_checked_at = excluded.liveness_checked_at,
                    ports_checked_at = excluded.ports_checked_at,
                    description = excluded.description"
            ),
            params![
                merged.address.to_string(),
                merged.name,
                merged.liveness.map(|l| l.as_str()),
                merged.os_name,
                merged.os_vendor,
                merged.os_family,
                merged.os_generation,
                merged.os_accuracy,
                merged.department,
                merged.admin,
                merged.liveness_checked_at.map(|t| t.timestamp()),
                merged.ports_checked_at.map(|t| t.timestamp()),
                merged.description,
            ],
        )?;
        tx.commit()?;

        Ok(if created { MergeOutcome::Created } else { MergeOutcome::Updated })
    }

    /// Fold a service patch into the stored record, creating it if absent.
    pub fn merge_service(&self, patch: ServicePatch) -> Result<MergeOutcome, StoreError> {
        let Some(key) = patch.key() else {
            return Ok(MergeOutcome::Rejected);
        };

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing = query_service(&tx, key)?;
        let created = existing.is_none();

        let Some(merged) = reconcile::merge_service(existing.clone(), patch) else {
            return Ok(MergeOutcome::Rejected);
        };
        if existing.as_ref() == Some(&merged) {
            return Ok(MergeOutcome::Unchanged);
        }

        tx.execute(
            &format!(
                "INSERT INTO service ({SERVICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(address, port, protocol) DO UPDATE SET
                    state = excluded.state,
                    reason = excluded.reason,
                    service_name = excluded.service_name,
                    product = excluded.product,
                    version = excluded.version,
                    department = excluded.department,
                    admin = excluded.admin,
                    observed_at = excluded.observed_at,
                    description = excluded.description"
            ),
            params![
                merged.address.to_string(),
                merged.port,
                merged.protocol.as_str(),
                merged.state.map(|s| s.as_str()),
                merged.reason,
                merged.service_name,
                merged.product,
                merged.version,
                merged.department,
                merged.admin,
                merged.observed_at.map(|t| t.timestamp()),
                merged.description,
            ],
        )?;
        tx.commit()?;

        Ok(if created { MergeOutcome::Created } else { MergeOutcome::Updated })
    }

    /// Pick the stalest eligible host for `policy` and stamp its timestamp
    /// column with `lease_until`, in one immediate transaction.
    ///
    /// Hosts whose column is later than `now` hold an unexpired lease and are
    /// skipped. Never-observed hosts (NULL) come first.
    pub fn claim_host(
        &self,
        policy: HostPolicy,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<IpAddr>, StoreError> {
        let column = policy.timestamp_column();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let address: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT address FROM host
                     WHERE (?1 = 0 OR liveness = 'up')
                       AND ({column} IS NULL OR {column} <= ?2)
                     ORDER BY {column} ASC, address ASC
                     LIMIT 1"
                ),
                params![policy.only_up(), now.timestamp()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(address) = address else {
            return Ok(None);
        };

        tx.execute(
            &format!("UPDATE host SET {column} = ?1 WHERE address = ?2"),
            params![lease_until.timestamp(), &address],
        )?;
        tx.commit()?;

        Ok(Some(parse_text(0, &address)?))
    }

    /// Pick the stalest open service and stamp `observed_at` with `lease_until`.
    pub fn claim_service(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ServiceKey>, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let row: Option<(String, u16, String)> = tx
            .query_row(
                "SELECT address, port, protocol FROM service
                 WHERE state = 'open'
                   AND (observed_at IS NULL OR observed_at <= ?1)
                 ORDER BY observed_at ASC, address ASC, port ASC, protocol ASC
                 LIMIT 1",
                params![now.timestamp()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((address, port, protocol)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE service SET observed_at = ?1 WHERE address = ?2 AND port = ?3 AND protocol = ?4",
            params![lease_until.timestamp(), &address, port, &protocol],
        )?;
        tx.commit()?;

        Ok(Some(ServiceKey::new(
            parse_text(0, &address)?,
            port,
            parse_text(2, &protocol)?,
        )))
    }

    /// All hosts, optionally filtered by liveness
    pub fn hosts(&self, liveness: Option<Liveness>) -> Result<Vec<HostRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM host
             WHERE (?1 IS NULL OR liveness = ?1)
             ORDER BY address"
        ))?;

        let hosts = stmt
            .query_map(params![liveness.map(|l| l.as_str())], row_to_host)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hosts)
    }

    /// All services, optionally filtered by host address and port state
    pub fn services(
        &self,
        address: Option<IpAddr>,
        state: Option<PortState>,
    ) -> Result<Vec<ServiceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM service
             WHERE (?1 IS NULL OR address = ?1)
               AND (?2 IS NULL OR state = ?2)
             ORDER BY address, port, protocol"
        ))?;

        let services = stmt
            .query_map(
                params![address.map(|a| a.to_string()), state.map(|s| s.as_str())],
                row_to_service,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(services)
    }
}

fn query_host(conn: &Connection, address: IpAddr) -> rusqlite::Result<Option<HostRecord>> {
    conn.query_row(
        &format!("SELECT {HOST_COLUMNS} FROM host WHERE address = ?1"),
        params![address.to_string()],
        row_to_host,
    )
    .optional()
}

fn query_service(conn: &Connection, key: ServiceKey) -> rusqlite::Result<Option<ServiceRecord>> {
    conn.query_row(
        &format!(
            "SELECT {SERVICE_COLUMNS} FROM service
             WHERE address = ?1 AND port = ?2 AND protocol = ?3"
        ),
        params![key.address.to_string(), key.port, key.protocol.as_str()],
        row_to_service,
    )
    .optional()
}

fn row_to_host(row: &rusqlite::Row) -> Result<HostRecord, rusqlite::Error> {
    let address: String = row.get(0)?;
    Ok(HostRecord {
        address: parse_text(0, &address)?,
        name: row.get(1)?,
        liveness: parse_optional::<Liveness>(row, 2)?,
        os_name: row.get(3)?,
        os_vendor: row.get(4)?,
        os_family: row.get(5)?,
        os_generation: row.get(6)?,
        os_accuracy: row.get(7)?,
        department: row.get(8)?,
        admin: row.get(9)?,
        liveness_checked_at: timestamp(row, 10)?,
        ports_checked_at: timestamp(row, 11)?,
        description: row.get(12)?,
    })
}

fn row_to_service(row: &rusqlite::Row) -> Result<ServiceRecord, rusqlite::Error> {
    let address: String = row.get(0)?;
    let protocol: String = row.get(2)?;
    Ok(ServiceRecord {
        address: parse_text(0, &address)?,
        port: row.get(1)?,
        protocol: parse_text::<Protocol>(2, &protocol)?,
        state: parse_optional::<PortState>(row, 3)?,
        reason: row.get(4)?,
        service_name: row.get(5)?,
        product: row.get(6)?,
        version: row.get(7)?,
        department: row.get(8)?,
        admin: row.get(9)?,
        observed_at: timestamp(row, 10)?,
        description: row.get(11)?,
    })
}

fn parse_text<T>(idx: usize, value: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_optional<T>(row: &rusqlite::Row, idx: usize) -> Result<Option<T>, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_text(idx, &v)).transpose()
}

fn timestamp(row: &rusqlite::Row, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let secs: Option<i64> = row.get(idx)?;
    secs.map(|secs| {
        DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
    })
    .transpose()
}
