//! libvirt control plane: `virsh`, `virt-install` and `qemu-img` wrappers.
//!
//! [`Virsh`] implements both the network seams ([`NetworkSource`],
//! [`NetworkControl`]) and the instance seam ([`VirtPlatform`]) used by the
//! provisioning workflow.

use std::net::Ipv4Addr;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cloud_init::DocumentPaths;
use crate::command_run::CommandRun;
use crate::error::{ProvisionError, Result};
use crate::network::{NetworkControl, NetworkDescriptor, NetworkSource, ReservationOutcome};

/// Run state of a defined domain, as reported by `virsh domstate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    ShutOff,
    Other(String),
}

impl DomainState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "shut off" => Self::ShutOff,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Whether `virsh destroy` is needed before undefining.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::ShutOff)
    }
}

/// Everything `virt-install` needs to import a prepared disk.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub disk: Utf8PathBuf,
    pub os_variant: String,
    pub network: String,
    pub documents: DocumentPaths,
}

/// Operations on virtual machine instances.
pub trait VirtPlatform {
    /// `None` when no domain with this name is defined.
    fn domain_state(&self, name: &str) -> Result<Option<DomainState>>;

    fn destroy_and_undefine(&self, name: &str) -> Result<()>;

    /// Create a qcow2 overlay of `size_bytes` at `disk` backed by `base`.
    fn prepare_disk(&self, base: &Utf8Path, disk: &Utf8Path, size_bytes: u64) -> Result<()>;

    fn create_instance(&self, spec: &InstanceSpec) -> Result<()>;

    /// Hardware address of the instance's interface on `network`.
    fn mac_address(&self, name: &str, network: &str) -> Result<String>;

    /// Graphical console URI, when the instance exposes one.
    fn display_uri(&self, name: &str) -> Result<Option<String>>;
}

/// Create a virsh command with optional connection URI
pub(crate) fn virsh_command(connect_uri: Option<&str>) -> Command {
    let mut cmd = Command::new("virsh");
    if let Some(uri) = connect_uri {
        cmd.arg("-c").arg(uri);
    }
    cmd
}

#[derive(Debug, Clone, Default)]
pub struct Virsh {
    pub connect: Option<String>,
}

impl Virsh {
    pub fn new(connect: Option<String>) -> Self {
        Self { connect }
    }

    fn command(&self) -> Command {
        virsh_command(self.connect.as_deref())
    }

    /// Run a virsh command and return its stdout
    fn run_virsh(&self, args: &[&str]) -> Result<String> {
        self.command().args(args).run_get_string()
    }
}

impl NetworkSource for Virsh {
    fn network_descriptor(&self, network: &str) -> Result<NetworkDescriptor> {
        let xml = self.run_virsh(&["net-dumpxml", network])?;
        NetworkDescriptor::from_xml(&xml)
    }
}

/// Decide whether an existing reservation for `ip` makes adding one redundant
/// or impossible. `None` means the address is free to bind.
fn classify_existing(
    descriptor: &NetworkDescriptor,
    mac: &str,
    ip: Ipv4Addr,
    hostname: &str,
) -> Option<Result<ReservationOutcome>> {
    let existing = descriptor.reservation_for(ip)?;
    let same_mac = existing
        .mac
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(mac));
    let same_name = existing.name.as_deref().map_or(true, |n| n == hostname);
    if same_mac && same_name {
        return Some(Ok(ReservationOutcome::AlreadyExists));
    }
    let holder = existing
        .mac
        .as_deref()
        .or(existing.name.as_deref())
        .unwrap_or("unknown host")
        .to_owned();
    Some(Err(ProvisionError::ReservationConflict { ip, holder }))
}

/// `<host>` element for `virsh net-update ... ip-dhcp-host`.
fn dhcp_host_xml(mac: &str, ip: Ipv4Addr, hostname: &str) -> String {
    use quick_xml::escape::escape;
    format!(
        "<host mac='{}' name='{}' ip='{}'/>",
        escape(mac),
        escape(hostname),
        ip
    )
}

impl NetworkControl for Virsh {
    fn add_reservation(
        &self,
        network: &str,
        mac: &str,
        ip: Ipv4Addr,
        hostname: &str,
    ) -> Result<ReservationOutcome> {
        let descriptor = self.network_descriptor(network)?;
        if let Some(outcome) = classify_existing(&descriptor, mac, ip, hostname) {
            return outcome;
        }

        let host = dhcp_host_xml(mac, ip, hostname);
        let out = self
            .command()
            .args(["net-update", network, "add", "ip-dhcp-host", &host])
            .args(["--live", "--config"])
            .run_captured()?;
        if out.success {
            info!("Reserved {} for {} ({}) on '{}'", ip, hostname, mac, network);
            return Ok(ReservationOutcome::Added);
        }

        // Another writer may have slipped in between our read and the update
        let descriptor = self.network_descriptor(network)?;
        match classify_existing(&descriptor, mac, ip, hostname) {
            Some(outcome) => outcome,
            None => Err(ProvisionError::command("virsh net-update", out.stderr)),
        }
    }

    fn release_reservations(&self, network: &str, hostname: &str) -> Result<usize> {
        let descriptor = self.network_descriptor(network)?;
        let mut released = 0;
        for r in descriptor
            .reservations
            .iter()
            .filter(|r| r.name.as_deref() == Some(hostname))
        {
            let host = match r.mac.as_deref() {
                Some(mac) => dhcp_host_xml(mac, r.ip, hostname),
                None => format!(
                    "<host name='{}' ip='{}'/>",
                    quick_xml::escape::escape(hostname),
                    r.ip
                ),
            };
            self.run_virsh(&[
                "net-update",
                network,
                "delete",
                "ip-dhcp-host",
                &host,
                "--live",
                "--config",
            ])?;
            info!("Released reservation {} for {} on '{}'", r.ip, hostname, network);
            released += 1;
        }
        Ok(released)
    }
}

/// virt-install sub-options are comma separated; a literal comma is doubled.
fn escape_option_value(value: &str) -> String {
    value.replace(',', ",,")
}

fn virt_install_args(spec: &InstanceSpec) -> Vec<String> {
    let docs = &spec.documents;
    vec![
        "--name".into(),
        spec.name.clone(),
        "--memory".into(),
        spec.memory_mb.to_string(),
        "--vcpus".into(),
        format!(
            "{n},sockets=1,cores={n},threads=1",
            n = spec.vcpus
        ),
        "--disk".into(),
        format!(
            "path={},format=qcow2,bus=virtio",
            escape_option_value(spec.disk.as_str())
        ),
        "--network".into(),
        format!("network={},model=virtio", escape_option_value(&spec.network)),
        "--os-variant".into(),
        spec.os_variant.clone(),
        "--import".into(),
        "--cloud-init".into(),
        format!(
            "meta-data={},user-data={},network-config={}",
            escape_option_value(docs.meta_data.as_str()),
            escape_option_value(docs.user_data.as_str()),
            escape_option_value(docs.network_config.as_str()),
        ),
        "--graphics".into(),
        "vnc,listen=127.0.0.1".into(),
        "--noautoconsole".into(),
    ]
}

#[derive(Debug, Deserialize)]
struct DomainXml {
    devices: DevicesXml,
}

#[derive(Debug, Deserialize)]
struct DevicesXml {
    #[serde(rename = "interface", default)]
    interfaces: Vec<InterfaceXml>,
}

#[derive(Debug, Deserialize)]
struct InterfaceXml {
    mac: Option<MacXml>,
    source: Option<SourceXml>,
}

#[derive(Debug, Deserialize)]
struct MacXml {
    #[serde(rename = "@address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct SourceXml {
    #[serde(rename = "@network")]
    network: Option<String>,
}

/// Pick the MAC of the interface attached to `network` from `virsh dumpxml` output.
fn mac_from_domain_xml(xml: &str, network: &str) -> Result<Option<String>> {
    let domain: DomainXml = quick_xml::de::from_str(xml)
        .map_err(|e| ProvisionError::config(format!("invalid domain XML: {e}")))?;
    Ok(domain
        .devices
        .interfaces
        .into_iter()
        .find(|iface| {
            iface
                .source
                .as_ref()
                .and_then(|s| s.network.as_deref())
                == Some(network)
        })
        .and_then(|iface| iface.mac)
        .map(|m| m.address.to_ascii_lowercase()))
}

impl VirtPlatform for Virsh {
    fn domain_state(&self, name: &str) -> Result<Option<DomainState>> {
        let out = self.command().args(["domstate", name]).run_captured()?;
        if out.success {
            return Ok(Some(DomainState::parse(&out.stdout)));
        }
        if out.stderr.contains("failed to get domain") || out.stderr.contains("Domain not found")
        {
            return Ok(None);
        }
        Err(ProvisionError::command("virsh domstate", out.stderr))
    }

    fn destroy_and_undefine(&self, name: &str) -> Result<()> {
        if let Some(state) = self.domain_state(name)? {
            if state.is_active() {
                info!("Stopping existing instance '{}'", name);
                self.run_virsh(&["destroy", name])?;
            }
        }
        info!("Undefining existing instance '{}'", name);
        self.run_virsh(&["undefine", name])?;
        Ok(())
    }

    fn prepare_disk(&self, base: &Utf8Path, disk: &Utf8Path, size_bytes: u64) -> Result<()> {
        debug!("Creating {} ({} bytes) backed by {}", disk, size_bytes, base);
        Command::new("qemu-img")
            .args(["create", "-q", "-f", "qcow2", "-F", "qcow2", "-b"])
            .args([base.as_str(), disk.as_str()])
            .arg(size_bytes.to_string())
            .run()
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        let mut cmd = Command::new("virt-install");
        if let Some(uri) = self.connect.as_deref() {
            cmd.args(["--connect", uri]);
        }
        cmd.args(virt_install_args(spec)).run()
    }

    fn mac_address(&self, name: &str, network: &str) -> Result<String> {
        let xml = self.run_virsh(&["dumpxml", name])?;
        mac_from_domain_xml(&xml, network)?.ok_or_else(|| {
            ProvisionError::config(format!(
                "instance '{name}' has no interface on network '{network}'"
            ))
        })
    }

    fn display_uri(&self, name: &str) -> Result<Option<String>> {
        let out = self.command().args(["domdisplay", name]).run_captured()?;
        let uri = out.stdout.trim();
        if !out.success || uri.is_empty() {
            warn!("No display endpoint for '{}': {}", name, out.stderr);
            return Ok(None);
        }
        Ok(Some(uri.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::DEFAULT_NETWORK_XML;
    use indoc::indoc;

    fn descriptor() -> NetworkDescriptor {
        NetworkDescriptor::from_xml(DEFAULT_NETWORK_XML).unwrap()
    }

    #[test]
    fn test_domain_state_parse() {
        assert_eq!(DomainState::parse("running\n\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off\n"), DomainState::ShutOff);
        assert!(!DomainState::ShutOff.is_active());
        assert!(DomainState::Other("crashed".into()).is_active());
    }

    #[test]
    fn test_classify_free_address() {
        let ip = Ipv4Addr::new(192, 168, 122, 13);
        assert!(classify_existing(&descriptor(), "52:54:00:00:00:13", ip, "web").is_none());
    }

    #[test]
    fn test_classify_identical_reservation() {
        let ip = Ipv4Addr::new(192, 168, 122, 10);
        let outcome = classify_existing(&descriptor(), "52:54:00:aa:00:10", ip, "alpha")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReservationOutcome::AlreadyExists);
    }

    #[test]
    fn test_classify_conflicting_reservation() {
        let ip = Ipv4Addr::new(192, 168, 122, 11);
        let err = classify_existing(&descriptor(), "52:54:00:00:00:01", ip, "web")
            .unwrap()
            .unwrap_err();
        match err {
            ProvisionError::ReservationConflict { ip: got, holder } => {
                assert_eq!(got, ip);
                assert_eq!(holder, "52:54:00:aa:00:11");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dhcp_host_xml_escapes() {
        let xml = dhcp_host_xml("52:54:00:00:00:01", Ipv4Addr::new(10, 0, 0, 5), "a'b<c>");
        assert_eq!(
            xml,
            "<host mac='52:54:00:00:00:01' name='a&apos;b&lt;c&gt;' ip='10.0.0.5'/>"
        );
    }

    #[test]
    fn test_virt_install_args() {
        let spec = InstanceSpec {
            name: "web,01".into(),
            memory_mb: 2048,
            vcpus: 4,
            disk: "/var/lib/vmup/web,01/disk.qcow2".into(),
            os_variant: "debian12".into(),
            network: "default".into(),
            documents: DocumentPaths {
                meta_data: "/s/meta-data".into(),
                network_config: "/s/network-config".into(),
                user_data: "/s/user-data".into(),
            },
        };
        let args = virt_install_args(&spec);
        let value_of = |flag: &str| {
            let idx = args.iter().position(|a| a == flag).unwrap();
            args[idx + 1].as_str()
        };
        assert_eq!(value_of("--name"), "web,01");
        assert_eq!(value_of("--vcpus"), "4,sockets=1,cores=4,threads=1");
        assert_eq!(
            value_of("--disk"),
            "path=/var/lib/vmup/web,,01/disk.qcow2,format=qcow2,bus=virtio"
        );
        assert_eq!(
            value_of("--cloud-init"),
            "meta-data=/s/meta-data,user-data=/s/user-data,network-config=/s/network-config"
        );
        assert!(args.iter().any(|a| a == "--import"));
        assert!(args.iter().any(|a| a == "--noautoconsole"));
    }

    #[test]
    fn test_mac_from_domain_xml() {
        let xml = indoc! {r#"
            <domain type='kvm' id='3'>
              <name>web01</name>
              <devices>
                <disk type='file' device='disk'>
                  <source file='/var/lib/vmup/web01/disk.qcow2'/>
                </disk>
                <interface type='network'>
                  <mac address='52:54:00:11:22:33'/>
                  <source network='isolated'/>
                </interface>
                <console type='pty'/>
                <interface type='network'>
                  <mac address='52:54:00:AB:CD:EF'/>
                  <source network='default' bridge='virbr0'/>
                  <model type='virtio'/>
                </interface>
              </devices>
            </domain>
        "#};
        assert_eq!(
            mac_from_domain_xml(xml, "default").unwrap().as_deref(),
            Some("52:54:00:ab:cd:ef")
        );
        assert_eq!(mac_from_domain_xml(xml, "missing").unwrap(), None);
    }
}
