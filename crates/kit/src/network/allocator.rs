//! Pick a free address from a network's dynamic range without a central
//! allocator.
//!
//! Candidates are walked in ascending order; the first one that is neither
//! reserved nor answering a reachability probe wins. The result is advisory:
//! nothing stops another host from claiming the address before the caller
//! registers its reservation, so the reservation call is the real point of
//! conflict resolution.
//!
//! Only the last octet is scanned. A range whose bounds differ in the first
//! three octets is rejected rather than walked.

use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use super::{DhcpRange, NetworkDescriptor, NetworkSource};
use crate::error::{ProvisionError, Result};

/// Decides whether an address is already in use on the wire.
pub trait ReachabilityProbe {
    fn is_reachable(&self, addr: Ipv4Addr) -> Result<bool>;
}

/// Single ICMP echo with a short deadline.
#[derive(Debug, Clone)]
pub struct PingProbe {
    pub timeout: Duration,
}

impl ReachabilityProbe for PingProbe {
    fn is_reachable(&self, addr: Ipv4Addr) -> Result<bool> {
        // ping's -W takes whole seconds
        let secs = self.timeout.as_secs().max(1).to_string();
        let status = Command::new("ping")
            .args(["-c", "1", "-q", "-W", &secs])
            .arg(addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ProvisionError::command("ping", e.to_string()))?;
        Ok(status.success())
    }
}

pub struct AddressAllocator<'a> {
    source: &'a dyn NetworkSource,
    probe: &'a dyn ReachabilityProbe,
}

impl<'a> AddressAllocator<'a> {
    pub fn new(source: &'a dyn NetworkSource, probe: &'a dyn ReachabilityProbe) -> Self {
        Self { source, probe }
    }

    /// Fetch a fresh descriptor for `network` and return its lowest free address.
    pub fn allocate(&self, network: &str) -> Result<Ipv4Addr> {
        let descriptor = self.source.network_descriptor(network)?;
        let addr = scan_for_free_address(&descriptor, self.probe)?;
        debug!("Allocated {} from network '{}'", addr, network);
        Ok(addr)
    }
}

/// Validate the descriptor's dynamic range and return it.
fn scannable_range(descriptor: &NetworkDescriptor) -> Result<DhcpRange> {
    let range = descriptor.range.ok_or_else(|| {
        ProvisionError::config(format!(
            "network '{}' has no DHCP range configured",
            descriptor.name
        ))
    })?;

    let (start, end) = (range.start.octets(), range.end.octets());
    if start[..3] != end[..3] {
        return Err(ProvisionError::config(format!(
            "DHCP range {range} of network '{}' spans more than one /24; \
             only the last octet is scanned",
            descriptor.name
        )));
    }
    if start[3] > end[3] {
        return Err(ProvisionError::config(format!(
            "DHCP range {range} of network '{}' ends before it starts",
            descriptor.name
        )));
    }
    Ok(range)
}

/// Walk the range in ascending order and return the first candidate that is
/// neither reserved nor reachable.
pub fn scan_for_free_address(
    descriptor: &NetworkDescriptor,
    probe: &dyn ReachabilityProbe,
) -> Result<Ipv4Addr> {
    let range = scannable_range(descriptor)?;
    let [a, b, c, first] = range.start.octets();
    let last = range.end.octets()[3];

    let mut scanned = 0u32;
    for host in first..=last {
        let candidate = Ipv4Addr::new(a, b, c, host);
        scanned += 1;

        if descriptor.is_reserved(candidate) {
            debug!("{candidate}: reserved");
            continue;
        }
        if probe.is_reachable(candidate)? {
            debug!("{candidate}: answers probe, treating as in use");
            continue;
        }
        return Ok(candidate);
    }

    Err(ProvisionError::Exhausted {
        start: range.start,
        end: range.end,
        scanned,
    })
}

/// Print the address `vmup create` would assign next
#[derive(clap::Args, Debug)]
pub(crate) struct AllocateOpts {
    /// Hypervisor connection URI (e.g., qemu:///system)
    #[clap(short = 'c', long = "connect")]
    pub connect: Option<String>,

    /// libvirt network to scan
    #[clap(long, default_value = "default")]
    pub network: String,

    /// Seconds to wait for each reachability probe
    #[clap(long, default_value_t = 1)]
    pub probe_timeout: u64,
}

pub(crate) fn run(opts: AllocateOpts) -> color_eyre::Result<()> {
    use color_eyre::eyre::Context as _;

    let virsh = crate::libvirt::Virsh::new(opts.connect);
    let probe = PingProbe {
        timeout: Duration::from_secs(opts.probe_timeout),
    };
    let progress = crate::utils::spinner(format!("Scanning {}", opts.network));
    let addr = AddressAllocator::new(&virsh, &probe).allocate(&opts.network);
    progress.finish_and_clear();
    let addr = addr.with_context(|| format!("Allocating from network '{}'", opts.network))?;
    println!("{addr}");
    Ok(())
}
