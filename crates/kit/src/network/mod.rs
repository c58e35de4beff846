//! Typed view of a libvirt virtual network and the control-plane seams used
//! to read it and to register static DHCP reservations.
//!
//! The descriptor is parsed from `virsh net-dumpxml` output. It is never
//! cached: other tools (and other `vmup` invocations) mutate the network at
//! any time, so every consumer fetches a fresh copy.

pub mod allocator;

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::{ProvisionError, Result};

/// An inclusive dynamic-address range handed out by the network's DHCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl std::fmt::Display for DhcpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A static binding of a hardware address to a fixed IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub mac: Option<String>,
    pub ip: Ipv4Addr,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub name: String,
    /// Address of the host side of the network, used as gateway and resolver
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub range: Option<DhcpRange>,
    pub reservations: Vec<Reservation>,
}

/// Outcome of registering a reservation with the network control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Added,
    /// An identical binding was already present
    AlreadyExists,
}

/// Read access to network descriptors.
pub trait NetworkSource {
    fn network_descriptor(&self, network: &str) -> Result<NetworkDescriptor>;
}

/// Read/write access to the network control plane.
pub trait NetworkControl: NetworkSource {
    /// Bind `mac` to `ip` under `hostname`.
    ///
    /// Fails with [`ProvisionError::ReservationConflict`] when the address is
    /// already bound to a different hardware address or host.
    fn add_reservation(
        &self,
        network: &str,
        mac: &str,
        ip: Ipv4Addr,
        hostname: &str,
    ) -> Result<ReservationOutcome>;

    /// Drop every reservation registered under `hostname`, returning how many
    /// were removed.
    fn release_reservations(&self, network: &str, hostname: &str) -> Result<usize>;
}

impl NetworkDescriptor {
    /// Parse the XML emitted by `virsh net-dumpxml`.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let parsed: NetworkXml = quick_xml::de::from_str(xml)
            .map_err(|e| ProvisionError::config(format!("invalid network XML: {e}")))?;

        let ip = parsed
            .ips
            .into_iter()
            .find(|ip| ip.family.as_deref().map_or(true, |f| f == "ipv4"))
            .ok_or_else(|| {
                ProvisionError::config(format!(
                    "network '{}' has no IPv4 address configured",
                    parsed.name
                ))
            })?;

        let address = parse_addr(ip.address.as_deref(), "ip address")?;
        let netmask = match (ip.netmask.as_deref(), ip.prefix) {
            (Some(mask), _) => parse_addr(Some(mask), "netmask")?,
            (None, Some(prefix)) => netmask_from_prefix(prefix)?,
            (None, None) => {
                return Err(ProvisionError::config(format!(
                    "network '{}' has neither netmask nor prefix",
                    parsed.name
                )))
            }
        };

        let dhcp = ip.dhcp.unwrap_or_default();
        let range = match dhcp.ranges.into_iter().next() {
            Some(r) => Some(DhcpRange {
                start: parse_addr(r.start.as_deref(), "dhcp range start")?,
                end: parse_addr(r.end.as_deref(), "dhcp range end")?,
            }),
            None => None,
        };

        let mut reservations = Vec::with_capacity(dhcp.hosts.len());
        for host in dhcp.hosts {
            // Entries without an address only pin a name; they reserve nothing
            let Some(ip) = host.ip.as_deref() else {
                continue;
            };
            reservations.push(Reservation {
                mac: host.mac.map(|m| m.to_ascii_lowercase()),
                ip: parse_addr(Some(ip), "dhcp host ip")?,
                name: host.name,
            });
        }

        Ok(Self {
            name: parsed.name,
            address,
            netmask,
            range,
            reservations,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        u32::from(self.netmask).count_ones() as u8
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.reservations.iter().any(|r| r.ip == ip)
    }

    /// The reservation holding `ip`, if any.
    pub fn reservation_for(&self, ip: Ipv4Addr) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.ip == ip)
    }
}

fn parse_addr(value: Option<&str>, what: &str) -> Result<Ipv4Addr> {
    let value = value.ok_or_else(|| ProvisionError::config(format!("missing {what}")))?;
    value
        .trim()
        .parse()
        .map_err(|_| ProvisionError::config(format!("invalid {what} '{value}'")))
}

fn netmask_from_prefix(prefix: u8) -> Result<Ipv4Addr> {
    if prefix > 32 {
        return Err(ProvisionError::config(format!("invalid prefix /{prefix}")));
    }
    let bits = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ok(Ipv4Addr::from(bits))
}

#[derive(Debug, Deserialize)]
struct NetworkXml {
    name: String,
    #[serde(rename = "ip", default)]
    ips: Vec<IpXml>,
}

#[derive(Debug, Deserialize)]
struct IpXml {
    #[serde(rename = "@family")]
    family: Option<String>,
    #[serde(rename = "@address")]
    address: Option<String>,
    #[serde(rename = "@netmask")]
    netmask: Option<String>,
    #[serde(rename = "@prefix")]
    prefix: Option<u8>,
    dhcp: Option<DhcpXml>,
}

#[derive(Debug, Default, Deserialize)]
struct DhcpXml {
    #[serde(rename = "range", default)]
    ranges: Vec<RangeXml>,
    #[serde(rename = "host", default)]
    hosts: Vec<HostXml>,
}

#[derive(Debug, Deserialize)]
struct RangeXml {
    #[serde(rename = "@start")]
    start: Option<String>,
    #[serde(rename = "@end")]
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostXml {
    #[serde(rename = "@mac")]
    mac: Option<String>,
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@ip")]
    ip: Option<String>,
}
