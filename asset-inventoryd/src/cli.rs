use std::net::IpAddr;
use std::path::PathBuf;
use clap::{Args, Parser, Subcommand};
use shared::types::{Protocol, ServiceKey};
use crate::modes::{Annotation, AnnotationTarget};

/// Network asset inventory: liveness, OS and service discovery over a shared
/// record store.
#[derive(Parser, Debug)]
#[command(name = "asset-inventoryd", version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file; built-in defaults apply without one.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ping every address of the asset list once.
    SweepLiveness {
        /// Asset list to read instead of the configured one.
        #[arg(long)]
        assets: Option<PathBuf>,
    },

    /// Keep re-pinging the host with the stalest liveness check.
    RefreshLiveness,

    /// OS-fingerprint every host currently up.
    SweepOs,

    /// Keep discovering open ports and fingerprinting services.
    RefreshServices,

    /// Record operator metadata for a host or one of its services.
    Annotate(AnnotateArgs),

    /// Serve the inventory over a read-only HTTP API.
    Serve,
}

#[derive(Args, Debug)]
pub struct AnnotateArgs {
    pub address: IpAddr,

    /// Annotate the service on this port instead of the host.
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value = "tcp", requires = "port")]
    pub protocol: Protocol,

    #[arg(long, conflicts_with = "port")]
    pub name: Option<String>,

    #[arg(long)]
    pub department: Option<String>,

    #[arg(long)]
    pub admin: Option<String>,

    #[arg(long)]
    pub description: Option<String>,
}

impl AnnotateArgs {
    pub fn target(&self) -> AnnotationTarget {
        match self.port {
            Some(port) => AnnotationTarget::Service(ServiceKey::new(self.address, port, self.protocol)),
            None => AnnotationTarget::Host(self.address),
        }
    }

    pub fn annotation(self) -> Annotation {
        Annotation {
            name: self.name,
            department: self.department,
            admin: self.admin,
            description: self.description,
        }
    }
}
