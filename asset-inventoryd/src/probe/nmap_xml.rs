use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node, ParsingOptions};
use shared::types::{PortState, Protocol, ServiceKey};
use crate::error::ProbeError;
use crate::probe::{OsFingerprint, PortObservation, ServiceFingerprint};

/// Read an OS report from `nmap -oX -`. A report without a `<host>` element
/// means the host did not answer and yields `None`.
pub fn parse_os(xml: &str, address: IpAddr) -> Result<Option<OsFingerprint>, ProbeError> {
    let doc = parse_document(xml)?;
    let Some(host) = child(doc.root_element(), "host") else {
        return Ok(None);
    };
    let Some(osmatch) = find_path(host, &["os", "osmatch"]) else {
        return Ok(None);
    };

    let os_name = required_attr(osmatch, "name")?.to_string();
    let osclass = child(osmatch, "osclass");
    let text = |name: &str| osclass.and_then(|c| c.attribute(name)).map(str::to_string);

    Ok(Some(OsFingerprint {
        address,
        os_name,
        os_vendor: text("vendor"),
        os_family: text("osfamily"),
        os_generation: text("osgen"),
        os_accuracy: osclass.map(|c| parse_attr::<u8>(c, "accuracy")).transpose()?.flatten(),
    }))
}

pub fn parse_ports(xml: &str, address: IpAddr) -> Result<Vec<PortObservation>, ProbeError> {
    let doc = parse_document(xml)?;
    let Some(ports) = child(doc.root_element(), "host").and_then(|h| child(h, "ports")) else {
        return Ok(Vec::new());
    };

    let mut open = Vec::new();
    for port in ports.children().filter(|n| n.has_tag_name("port")) {
        let number: u16 = parse_attr(port, "portid")?
            .ok_or_else(|| malformed("port without portid"))?;
        let protocol: Protocol = parse_attr(port, "protocol")?.unwrap_or(Protocol::Tcp);
        let state_node = child(port, "state").ok_or_else(|| malformed("port without state"))?;
        let state: PortState = parse_attr(state_node, "state")?
            .ok_or_else(|| malformed("port state without value"))?;

        if state.may_be_open() {
            open.push(PortObservation {
                key: ServiceKey::new(address, number, protocol),
                state,
            });
        }
    }

    Ok(open)
}

pub fn parse_service(xml: &str, key: ServiceKey) -> Result<ServiceFingerprint, ProbeError> {
    let doc = parse_document(xml)?;
    let root = doc.root_element();
    let Some(host) = child(root, "host") else {
        return Ok(ServiceFingerprint::key_only(key));
    };

    let observed_at = match find_path(root, &["runstats", "finished"]) {
        Some(finished) => parse_attr::<i64>(finished, "time")?
            .map(|secs| {
                DateTime::<Utc>::from_timestamp(secs, 0)
                    .ok_or_else(|| malformed(format!("finish time {} out of range", secs)))
            })
            .transpose()?,
        None => None,
    };

    let mut fp = ServiceFingerprint {
        observed_at,
        ..ServiceFingerprint::key_only(key)
    };

    let Some(port) = child(host, "ports").and_then(|p| child(p, "port")) else {
        return Ok(fp);
    };

    if let Some(state) = child(port, "state") {
        fp.state = parse_attr(state, "state")?;
        fp.reason = state.attribute("reason").map(str::to_string);
    }
    if let Some(service) = child(port, "service") {
        fp.service_name = service.attribute("name").map(str::to_string);
        fp.product = service.attribute("product").map(str::to_string);
        fp.version = service.attribute("version").map(str::to_string);
    }

    Ok(fp)
}

fn parse_document(xml: &str) -> Result<Document<'_>, ProbeError> {
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;

    let doc = Document::parse_with_options(xml, options)
        .map_err(|e| malformed(format!("invalid XML: {}", e)))?;
    if !doc.root_element().has_tag_name("nmaprun") {
        return Err(malformed(format!(
            "unexpected root element <{}>",
            doc.root_element().tag_name().name()
        )));
    }
    Ok(doc)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn find_path<'a, 'input>(node: Node<'a, 'input>, path: &[&str]) -> Option<Node<'a, 'input>> {
    path.iter().try_fold(node, |current, name| child(current, name))
}

fn required_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, ProbeError> {
    node.attribute(name).ok_or_else(|| {
        malformed(format!("<{}> without {}", node.tag_name().name(), name))
    })
}

fn parse_attr<T>(node: Node<'_, '_>, name: &str) -> Result<Option<T>, ProbeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    node.attribute(name)
        .map(|raw| {
            raw.parse().map_err(|e| {
                malformed(format!("<{} {}={:?}>: {}", node.tag_name().name(), name, raw, e))
            })
        })
        .transpose()
}

fn malformed(msg: impl Into<String>) -> ProbeError {
    ProbeError::MalformedOutput(msg.into())
}
