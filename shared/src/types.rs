use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Returned when a stored or scanned string is not a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }
}

/// Reachability of a host as reported by the last liveness probe.
/// An unknown state is modelled as `None` on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Up,
    Down,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Up => "up",
            Liveness::Down => "down",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Liveness {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Liveness::Up),
            "down" => Ok(Liveness::Down),
            other => Err(UnknownVariant::new("liveness", other)),
        }
    }
}

/// Port state vocabulary of the fingerprint scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "unfiltered")]
    Unfiltered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "closed|filtered")]
    ClosedFiltered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::Unfiltered => "unfiltered",
            PortState::OpenFiltered => "open|filtered",
            PortState::ClosedFiltered => "closed|filtered",
        }
    }

    /// True for the states a port sweep keeps: `open` and `open|filtered`.
    pub fn may_be_open(&self) -> bool {
        matches!(self, PortState::Open | PortState::OpenFiltered)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "unfiltered" => Ok(PortState::Unfiltered),
            "open|filtered" => Ok(PortState::OpenFiltered),
            "closed|filtered" => Ok(PortState::ClosedFiltered),
            other => Err(UnknownVariant::new("port state", other)),
        }
    }
}

/// Transport protocol of a service endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(UnknownVariant::new("protocol", other)),
        }
    }
}

/// Persisted inventory entry for one IP address.
/// The address is the key; every other field is independently nullable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub address: IpAddr,

    /// Operator supplied host name
    pub name: Option<String>,

    pub liveness: Option<Liveness>,

    /// Best OS match name, e.g. "Linux 2.6.32 - 3.10"
    pub os_name: Option<String>,
    pub os_vendor: Option<String>,
    pub os_family: Option<String>,
    pub os_generation: Option<String>,

    /// OS match accuracy, 0-100
    pub os_accuracy: Option<u8>,

    pub department: Option<String>,
    pub admin: Option<String>,

    /// Last liveness observation (or an unexpired claim lease)
    pub liveness_checked_at: Option<DateTime<Utc>>,

    /// Last completed port sweep (or an unexpired claim lease)
    pub ports_checked_at: Option<DateTime<Utc>>,

    pub description: Option<String>,
}

impl HostRecord {
    /// A record carrying only its key.
    pub fn empty(address: IpAddr) -> Self {
        Self {
            address,
            name: None,
            liveness: None,
            os_name: None,
            os_vendor: None,
            os_family: None,
            os_generation: None,
            os_accuracy: None,
            department: None,
            admin: None,
            liveness_checked_at: None,
            ports_checked_at: None,
            description: None,
        }
    }
}

/// Partial observation of a host: only the fields learned by one probe are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPatch {
    pub address: Option<IpAddr>,
    pub name: Option<String>,
    pub liveness: Option<Liveness>,
    pub os_name: Option<String>,
    pub os_vendor: Option<String>,
    pub os_family: Option<String>,
    pub os_generation: Option<String>,
    pub os_accuracy: Option<u8>,
    pub department: Option<String>,
    pub admin: Option<String>,
    pub liveness_checked_at: Option<DateTime<Utc>>,
    pub ports_checked_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

impl HostPatch {
    pub fn for_address(address: IpAddr) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }
}

/// Key of a service record: (address, port, protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl ServiceKey {
    pub fn new(address: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self { address, port, protocol }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(v4) => write!(f, "{}:{}/{}", v4, self.port, self.protocol),
            IpAddr::V6(v6) => write!(f, "[{}]:{}/{}", v6, self.port, self.protocol),
        }
    }
}

/// Persisted inventory entry for one service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,

    pub state: Option<PortState>,

    /// Scanner's reason for the state, e.g. "syn-ack"
    pub reason: Option<String>,

    /// Guessed service name, e.g. "http"
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,

    pub department: Option<String>,
    pub admin: Option<String>,

    /// Last service fingerprint (or an unexpired claim lease)
    pub observed_at: Option<DateTime<Utc>>,

    pub description: Option<String>,
}

impl ServiceRecord {
    pub fn empty(key: ServiceKey) -> Self {
        Self {
            address: key.address,
            port: key.port,
            protocol: key.protocol,
            state: None,
            reason: None,
            service_name: None,
            product: None,
            version: None,
            department: None,
            admin: None,
            observed_at: None,
            description: None,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.address, self.port, self.protocol)
    }
}

/// Partial observation of a service endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePatch {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub state: Option<PortState>,
    pub reason: Option<String>,
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub department: Option<String>,
    pub admin: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

impl ServicePatch {
    pub fn for_key(key: ServiceKey) -> Self {
        Self {
            address: Some(key.address),
            port: Some(key.port),
            protocol: Some(key.protocol),
            ..Default::default()
        }
    }

    /// The full key, or `None` when any key field is missing.
    pub fn key(&self) -> Option<ServiceKey> {
        Some(ServiceKey::new(self.address?, self.port?, self.protocol?))
    }
}
