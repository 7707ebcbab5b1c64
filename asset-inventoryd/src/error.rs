use std::path::PathBuf;
use std::time::Duration;

/// Failures preparing the address list for a bulk sweep. Fatal to the procedure.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read asset list {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid asset entry {entry:?}: {reason}")]
    InvalidEntry { entry: String, reason: String },

    #[error("network {entry} has {hosts} hosts, more than the limit of {limit}")]
    NetworkTooLarge { entry: String, hosts: u128, limit: u64 },
}

/// A probe capability cannot be used at all. Raised at construction time.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{program} is not available: {reason}")]
    Unavailable { program: String, reason: String },
}

/// Failure of a single probe. Affects only the key being probed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exceeded its time budget of {budget:?}")]
    TimedOut { program: String, budget: Duration },

    #[error("malformed scanner output: {0}")]
    MalformedOutput(String),
}

/// Record store failure. Fatal to the calling procedure; never retried here.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("claim lease of {lease:?} is out of range")]
    LeaseOutOfRange { lease: Duration },

    #[error("record store is closed")]
    Closed,
}
