use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use ipnetwork::IpNetwork;
use crate::error::InputError;

/// Read the asset file: one address or CIDR network per line.
/// Blank lines and `#` comments are skipped.
pub fn load_asset_list(path: impl AsRef<Path>) -> Result<Vec<String>, InputError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Expand entries into individual host addresses, dropping duplicates.
pub fn expand(entries: &[String], max_network_hosts: u64) -> Result<Vec<IpAddr>, InputError> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for entry in entries {
        let hosts = if entry.contains('/') {
            network_hosts(entry, max_network_hosts)?
        } else {
            let address = entry.parse::<IpAddr>().map_err(|e| InputError::InvalidEntry {
                entry: entry.clone(),
                reason: e.to_string(),
            })?;
            vec![address]
        };

        for host in hosts {
            if seen.insert(host) {
                addresses.push(host);
            }
        }
    }

    Ok(addresses)
}

/// Usable host addresses of a network: IPv4 drops the network and broadcast
/// addresses below /31, IPv6 drops the subnet-router anycast address below /127.
fn network_hosts(entry: &str, limit: u64) -> Result<Vec<IpAddr>, InputError> {
    let network: IpNetwork = entry.parse().map_err(|e: ipnetwork::IpNetworkError| {
        InputError::InvalidEntry {
            entry: entry.to_string(),
            reason: e.to_string(),
        }
    })?;

    let too_large = |hosts: u128| InputError::NetworkTooLarge {
        entry: entry.to_string(),
        hosts,
        limit,
    };

    match network {
        IpNetwork::V4(net) => {
            let size = u128::from(net.size());
            if size > u128::from(limit) {
                return Err(too_large(size));
            }
            let trim = net.prefix() < 31;
            Ok(net
                .iter()
                .filter(|ip| !trim || (*ip != net.network() && *ip != net.broadcast()))
                .map(IpAddr::V4)
                .collect())
        }
        IpNetwork::V6(net) => {
            let size = net.size();
            if size > u128::from(limit) {
                return Err(too_large(size));
            }
            let trim = net.prefix() < 127;
            Ok(net
                .iter()
                .filter(|ip| !trim || *ip != net.network())
                .map(IpAddr::V6)
                .collect())
        }
    }
}
