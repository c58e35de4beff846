//! Render the cloud-init NoCloud documents for a new guest.
//!
//! Three documents are produced: `meta-data` (identity), `network-config`
//! (static addressing, network config v2) and `user-data` (`#cloud-config`).
//! Rendering is a pure function of its inputs: every document is built from
//! typed structs with ordered fields and serialized by `serde_yaml`, so the
//! same inputs always give the same bytes and caller-supplied strings can
//! never change the structure of a document.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::{ProvisionError, Result};
use crate::images::OsFamily;
use crate::vm::VmIdentity;

pub const META_DATA: &str = "meta-data";
pub const NETWORK_CONFIG: &str = "network-config";
pub const USER_DATA: &str = "user-data";

/// Services opened in the guest firewall.
const FIREWALL_SERVICES: &[&str] = &["ssh", "nfs", "http", "https"];

/// NFSv4.2 with FS-Cache and Kerberos privacy (krb5p encrypts the transport).
const NFS_MOUNT_OPTIONS: &str = "vers=4.2,fsc,sec=krb5p,_netdev,nofail";

const SSHD_HARDENING_PATH: &str = "/etc/ssh/sshd_config.d/60-vmup-hardening.conf";
const SSHD_HARDENING: &str = "\
PasswordAuthentication no
KbdInteractiveAuthentication no
PermitRootLogin no
PubkeyAuthentication yes
";

/// An NFS export mounted in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsShare {
    pub server: String,
    pub export: String,
    pub mount_point: String,
}

/// Addressing parameters of the network the guest is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetwork {
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct SynthesisInputs<'a> {
    pub identity: &'a VmIdentity,
    pub os_family: OsFamily,
    pub admin_user: &'a str,
    pub network: &'a GuestNetwork,
    pub nfs: &'a NfsShare,
    /// Base URL; the VM name is appended as a percent-encoded path segment
    pub callback_base_url: &'a str,
}

/// The rendered documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifactSet {
    pub meta_data: String,
    pub network_config: String,
    pub user_data: String,
}

/// Where [`ConfigArtifactSet::write_to`] put each document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPaths {
    pub meta_data: Utf8PathBuf,
    pub network_config: Utf8PathBuf,
    pub user_data: Utf8PathBuf,
}

impl ConfigArtifactSet {
    pub fn write_to(&self, dir: &Utf8Path) -> Result<DocumentPaths> {
        std::fs::create_dir_all(dir)?;
        let paths = DocumentPaths {
            meta_data: dir.join(META_DATA),
            network_config: dir.join(NETWORK_CONFIG),
            user_data: dir.join(USER_DATA),
        };
        std::fs::write(&paths.meta_data, &self.meta_data)?;
        std::fs::write(&paths.network_config, &self.network_config)?;
        std::fs::write(&paths.user_data, &self.user_data)?;
        Ok(paths)
    }
}

#[derive(Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

#[derive(Serialize)]
struct NetworkConfig {
    version: u8,
    ethernets: BTreeMap<&'static str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    #[serde(rename = "match")]
    matcher: InterfaceMatch,
    dhcp4: bool,
    addresses: Vec<String>,
    routes: Vec<Route>,
    nameservers: Nameservers,
}

#[derive(Serialize)]
struct InterfaceMatch {
    name: &'static str,
}

#[derive(Serialize)]
struct Route {
    to: &'static str,
    via: Ipv4Addr,
}

#[derive(Serialize)]
struct Nameservers {
    addresses: Vec<Ipv4Addr>,
    search: Vec<String>,
}

#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    fqdn: String,
    prefer_fqdn_over_hostname: bool,
    manage_etc_hosts: bool,
    users: Vec<User<'a>>,
    ssh_pwauth: bool,
    disable_root: bool,
    package_update: bool,
    packages: &'static [&'static str],
    write_files: Vec<WriteFile>,
    mounts: Vec<[String; 6]>,
    runcmd: Vec<Vec<String>>,
    phone_home: PhoneHome,
    power_state: PowerState,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    gecos: &'static str,
    shell: &'static str,
    sudo: &'static str,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Serialize)]
struct WriteFile {
    path: &'static str,
    owner: &'static str,
    permissions: &'static str,
    content: &'static str,
}

#[derive(Serialize)]
struct PhoneHome {
    url: String,
    post: &'static [&'static str],
    tries: u32,
}

#[derive(Serialize)]
struct PowerState {
    mode: &'static str,
    delay: &'static str,
    message: &'static str,
    timeout: u32,
}

fn to_yaml<T: Serialize>(doc: &T, what: &str) -> Result<String> {
    serde_yaml::to_string(doc)
        .map_err(|e| ProvisionError::config(format!("failed to render {what}: {e}")))
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

fn packages_for(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Debian => &[
            "qemu-guest-agent",
            "openssh-server",
            "firewalld",
            "nfs-common",
            "cachefilesd",
        ],
        OsFamily::RedHat => &[
            "qemu-guest-agent",
            "openssh-server",
            "firewalld",
            "nfs-utils",
            "cachefilesd",
        ],
    }
}

fn first_boot_commands() -> Vec<Vec<String>> {
    let mut cmds = vec![argv(&["systemctl", "enable", "--now", "firewalld"])];
    for service in FIREWALL_SERVICES {
        cmds.push(vec![
            "firewall-cmd".to_owned(),
            "--permanent".to_owned(),
            format!("--add-service={service}"),
        ]);
    }
    cmds.push(argv(&["firewall-cmd", "--reload"]));
    cmds.push(argv(&["systemctl", "enable", "--now", "cachefilesd"]));
    // The unit is ssh on Debian derivatives and sshd elsewhere
    cmds.push(argv(&[
        "sh",
        "-c",
        "systemctl reload-or-restart sshd || systemctl reload-or-restart ssh",
    ]));
    cmds
}

/// Render all three documents.
pub fn synthesize(inputs: &SynthesisInputs<'_>) -> Result<ConfigArtifactSet> {
    let identity = inputs.identity;
    let hostname = identity.hostname.as_str();

    let meta_data = to_yaml(
        &MetaData {
            instance_id: format!("vmup-{}", identity.name),
            local_hostname: hostname,
        },
        META_DATA,
    )?;

    let ethernet = Ethernet {
        matcher: InterfaceMatch { name: "e*" },
        dhcp4: false,
        addresses: vec![format!("{}/{}", identity.address, inputs.network.prefix_len)],
        routes: vec![Route {
            to: "default",
            via: inputs.network.gateway,
        }],
        nameservers: Nameservers {
            addresses: inputs.network.nameservers.clone(),
            search: vec![inputs.network.domain.clone()],
        },
    };
    let network_config = to_yaml(
        &NetworkConfig {
            version: 2,
            ethernets: BTreeMap::from([("primary", ethernet)]),
        },
        NETWORK_CONFIG,
    )?;

    let nfs = inputs.nfs;
    let user_data = UserData {
        hostname,
        fqdn: format!("{hostname}.{}", inputs.network.domain),
        prefer_fqdn_over_hostname: false,
        manage_etc_hosts: true,
        users: vec![User {
            name: inputs.admin_user,
            gecos: "vmup administrator",
            shell: "/bin/bash",
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            lock_passwd: true,
            ssh_authorized_keys: vec![identity.keypair.public_key.trim()],
        }],
        ssh_pwauth: false,
        disable_root: true,
        package_update: true,
        packages: packages_for(inputs.os_family),
        write_files: vec![WriteFile {
            path: SSHD_HARDENING_PATH,
            owner: "root:root",
            permissions: "0600",
            content: SSHD_HARDENING,
        }],
        mounts: vec![[
            format!("{}:{}", nfs.server, nfs.export),
            nfs.mount_point.clone(),
            "nfs4".to_owned(),
            NFS_MOUNT_OPTIONS.to_owned(),
            "0".to_owned(),
            "0".to_owned(),
        ]],
        runcmd: first_boot_commands(),
        phone_home: PhoneHome {
            url: format!(
                "{}/{}",
                inputs.callback_base_url.trim_end_matches('/'),
                urlencoding::encode(identity.name.as_str())
            ),
            post: &["pub_key_ed25519", "instance_id", "hostname", "fqdn"],
            tries: 10,
        },
        power_state: PowerState {
            mode: "reboot",
            delay: "+1",
            message: "vmup: rebooting after first-boot configuration",
            timeout: 30,
        },
    };
    let user_data = format!("#cloud-config\n{}", to_yaml(&user_data, USER_DATA)?);

    Ok(ConfigArtifactSet {
        meta_data,
        network_config,
        user_data,
    })
}
