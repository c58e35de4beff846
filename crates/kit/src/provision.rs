//! The provisioning workflow.
//!
//! A [`Provisioner`] walks one VM through
//! `Idle → ImageReady → DiskReady → AddressAssigned → CredentialReady →
//! ConfigSynthesized → InstanceLaunched → AddressRegistered →
//! AwaitingGuestReady → Ready | Failed`, calling out to its collaborators at
//! each step. Errors halt the walk where they occur. Two failures are
//! handled in place: a reservation conflict (the address was taken after we
//! picked it) tears the new instance down and allocates again once, and a
//! readiness timeout leaves the instance running and is reported as a
//! warning.

use std::net::Ipv4Addr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::cloud_init::{self, GuestNetwork, NfsShare, SynthesisInputs};
use crate::credentials::KeyStore;
use crate::error::{ProvisionError, Result};
use crate::images::{ImageSource, ResolvedImage};
use crate::libvirt::{InstanceSpec, VirtPlatform};
use crate::network::allocator::{scan_for_free_address, ReachabilityProbe};
use crate::network::NetworkControl;
use crate::readiness::{GuestReadiness, GuestTarget};
use crate::ssh_config::{Registry, RegistryEntry};
use crate::utils;
use crate::vm::{self, VmIdentity, VmName};

const DISK_FILE_NAME: &str = "disk.qcow2";
const KNOWN_HOSTS_FILE_NAME: &str = "known_hosts";
/// Port of the default completion-callback listener on the network's host side
const DEFAULT_CALLBACK_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum ProvisionState {
    Idle,
    ImageReady,
    DiskReady,
    AddressAssigned,
    CredentialReady,
    ConfigSynthesized,
    InstanceLaunched,
    AddressRegistered,
    AwaitingGuestReady,
    Ready,
    Failed,
}

/// Settings shared by every VM created with this configuration.
#[derive(clap::Args, Debug, Clone)]
pub struct ProvisionConfig {
    /// Hypervisor connection URI (e.g., qemu:///system)
    #[clap(short = 'c', long = "connect")]
    pub connect: Option<String>,

    /// libvirt network to attach to and reserve the address in
    #[clap(long, default_value = "default")]
    pub network: String,

    /// Directory holding per-VM documents and disks
    #[clap(long, default_value_t = crate::paths::state_dir())]
    pub state_dir: Utf8PathBuf,

    /// Directory holding per-VM SSH keypairs
    #[clap(long, default_value_t = crate::paths::keys_dir())]
    pub keys_dir: Utf8PathBuf,

    /// Base image cache directory
    #[clap(long, default_value_t = crate::paths::image_dir())]
    pub image_dir: Utf8PathBuf,

    /// SSH client configuration to record the new host in
    #[clap(long, default_value_t = crate::paths::ssh_config())]
    pub ssh_config: Utf8PathBuf,

    /// DNS domain of the guests
    #[clap(long, default_value = "local")]
    pub domain: String,

    /// Administrative account created in the guest
    #[clap(long, default_value = "admin")]
    pub admin_user: String,

    /// NFS server (default: the network's host address)
    #[clap(long)]
    pub nfs_server: Option<String>,

    #[clap(long, default_value = "/srv/nfs/shared")]
    pub nfs_export: String,

    #[clap(long, default_value = "/mnt/shared")]
    pub nfs_mount: String,

    /// Base URL the guest reports completion to (default: http://<host address>:8080/vmup/ready)
    #[clap(long)]
    pub callback_url: Option<String>,

    /// Seconds to wait for each reachability probe
    #[clap(long, default_value_t = 1)]
    pub probe_timeout: u64,

    /// Readiness checks before giving up
    #[clap(long, default_value_t = 60)]
    pub ready_attempts: u32,

    /// Seconds between readiness checks
    #[clap(long, default_value_t = 5)]
    pub ready_interval: u64,
}

/// One VM to provision.
#[derive(Debug, Clone)]
pub struct VmRequest {
    pub name: VmName,
    /// Derived from the name when absent
    pub hostname: Option<String>,
    pub os: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub disk_size: u64,
    /// Destroy and undefine an existing instance of the same name
    pub replace: bool,
}

/// External services the workflow drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub images: &'a dyn ImageSource,
    pub virt: &'a dyn VirtPlatform,
    pub network: &'a dyn NetworkControl,
    pub probe: &'a dyn ReachabilityProbe,
    pub keys: &'a KeyStore<'a>,
    pub readiness: &'a dyn GuestReadiness,
    pub registry: &'a Registry<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub state: ProvisionState,
    pub name: String,
    pub hostname: String,
    pub address: Ipv4Addr,
    /// Alias recorded in the SSH configuration, once the guest is ready
    pub alias: Option<String>,
    pub display: Option<String>,
    /// Non-fatal problem the caller should surface
    pub warning: Option<String>,
}

pub struct Provisioner<'a> {
    config: &'a ProvisionConfig,
    deps: Collaborators<'a>,
    history: Vec<ProvisionState>,
}

/// Instance launched and bound to its address.
struct Launched {
    identity: VmIdentity,
    known_hosts_file: Utf8PathBuf,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a ProvisionConfig, deps: Collaborators<'a>) -> Self {
        Self {
            config,
            deps,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.history.last().copied().unwrap_or(ProvisionState::Idle)
    }

    /// Every state entered so far, in order.
    #[cfg(test)]
    pub fn history(&self) -> &[ProvisionState] {
        &self.history
    }

    fn enter(&mut self, state: ProvisionState) {
        info!("{} -> {}", self.state(), state);
        self.history.push(state);
    }

    pub fn run(&mut self, request: &VmRequest) -> Result<ProvisionReport> {
        self.history.clear();
        self.history.push(ProvisionState::Idle);
        let result = self.run_inner(request);
        if result.is_err() {
            self.enter(ProvisionState::Failed);
        }
        result
    }

    fn run_inner(&mut self, request: &VmRequest) -> Result<ProvisionReport> {
        let name = &request.name;
        let hostname = match &request.hostname {
            Some(h) => {
                vm::validate_hostname(h)?;
                h.clone()
            }
            None => name.default_hostname()?,
        };

        self.resolve_existing(request, &hostname)?;

        let image = self.deps.images.resolve(&request.os)?;
        self.enter(ProvisionState::ImageReady);

        let vm_dir = self.config.state_dir.join(name.as_str());
        std::fs::create_dir_all(&vm_dir)?;
        let disk = vm_dir.join(DISK_FILE_NAME);
        self.prepare_disk(&image, &disk, request.disk_size)?;

        let spec = InstanceSpec {
            name: name.to_string(),
            memory_mb: request.memory_mb,
            vcpus: request.vcpus,
            disk,
            os_variant: image.entry.os_variant.to_owned(),
            network: self.config.network.clone(),
            // Filled in once the documents are written
            documents: cloud_init::DocumentPaths {
                meta_data: vm_dir.join(cloud_init::META_DATA),
                network_config: vm_dir.join(cloud_init::NETWORK_CONFIG),
                user_data: vm_dir.join(cloud_init::USER_DATA),
            },
        };

        let family = image.entry.family;
        let launched = match self.launch_and_register(request, &hostname, &spec, family) {
            Ok(l) => l,
            Err(ProvisionError::ReservationConflict { ip, holder }) => {
                warn!(
                    "Address {} was claimed by {} after allocation; retrying with a new address",
                    ip, holder
                );
                self.deps.virt.destroy_and_undefine(name.as_str())?;
                // The first guest may already have run cloud-init on its disk
                self.prepare_disk(&image, &spec.disk, request.disk_size)?;
                match self.launch_and_register(request, &hostname, &spec, family) {
                    Err(ProvisionError::ReservationConflict { ip, holder }) => {
                        self.deps.virt.destroy_and_undefine(name.as_str())?;
                        return Err(ProvisionError::conflict(format!(
                            "address {ip} for '{name}' is already reserved by {holder} \
                             (second conflict after re-allocation)"
                        )));
                    }
                    other => other?,
                }
            }
            Err(e) => return Err(e),
        };

        self.await_guest(launched)
    }

    /// Create a fresh overlay over the base image, replacing any earlier one.
    fn prepare_disk(
        &mut self,
        image: &ResolvedImage,
        disk: &Utf8Path,
        size: u64,
    ) -> Result<()> {
        match std::fs::remove_file(disk) {
            Ok(()) => info!("Discarded previous disk {}", disk),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.deps.virt.prepare_disk(&image.path, disk, size)?;
        self.enter(ProvisionState::DiskReady);
        Ok(())
    }

    /// Fail on an existing instance unless replacing it was requested.
    fn resolve_existing(&mut self, request: &VmRequest, hostname: &str) -> Result<()> {
        let name = request.name.as_str();
        let Some(state) = self.deps.virt.domain_state(name)? else {
            return Ok(());
        };
        if !request.replace {
            return Err(ProvisionError::conflict(format!(
                "instance '{name}' already exists ({state:?}); pass --replace to recreate it"
            )));
        }
        warn!("Replacing existing instance '{}' ({:?})", name, state);
        self.deps.virt.destroy_and_undefine(name)?;
        let released = self
            .deps
            .network
            .release_reservations(&self.config.network, hostname)?;
        if released > 0 {
            info!("Released {} stale reservation(s) for {}", released, hostname);
        }
        Ok(())
    }

    /// AddressAssigned through AddressRegistered.
    fn launch_and_register(
        &mut self,
        request: &VmRequest,
        hostname: &str,
        spec: &InstanceSpec,
        os_family: crate::images::OsFamily,
    ) -> Result<Launched> {
        let config = self.config;
        let descriptor = self.deps.network.network_descriptor(&config.network)?;
        let progress = utils::spinner(format!("Scanning {} for a free address", config.network));
        let address = scan_for_free_address(&descriptor, self.deps.probe);
        progress.finish_and_clear();
        let address = address?;
        info!("Assigned {} to '{}'", address, request.name);
        self.enter(ProvisionState::AddressAssigned);

        let keypair = self.deps.keys.ensure_keypair(&request.name)?;
        self.enter(ProvisionState::CredentialReady);

        let identity = VmIdentity {
            name: request.name.clone(),
            hostname: hostname.to_owned(),
            address,
            keypair,
        };
        let gateway = descriptor.address;
        let network = GuestNetwork {
            prefix_len: descriptor.prefix_len(),
            gateway,
            nameservers: vec![gateway],
            domain: config.domain.clone(),
        };
        let nfs = NfsShare {
            server: config
                .nfs_server
                .clone()
                .unwrap_or_else(|| gateway.to_string()),
            export: config.nfs_export.clone(),
            mount_point: config.nfs_mount.clone(),
        };
        let callback = config
            .callback_url
            .clone()
            .unwrap_or_else(|| format!("http://{gateway}:{DEFAULT_CALLBACK_PORT}/vmup/ready"));
        let documents = cloud_init::synthesize(&SynthesisInputs {
            identity: &identity,
            os_family,
            admin_user: &config.admin_user,
            network: &network,
            nfs: &nfs,
            callback_base_url: &callback,
        })?;
        let vm_dir = config.state_dir.join(request.name.as_str());
        let paths = documents.write_to(&vm_dir)?;
        self.enter(ProvisionState::ConfigSynthesized);

        // A new instance brings new host keys
        let known_hosts_file = self
            .deps
            .keys
            .key_dir(&request.name)
            .join(KNOWN_HOSTS_FILE_NAME);
        if known_hosts_file.exists() {
            std::fs::remove_file(&known_hosts_file)?;
        }

        let spec = InstanceSpec {
            documents: paths,
            ..spec.clone()
        };
        self.deps.virt.create_instance(&spec)?;
        info!("Launched instance '{}'", spec.name);
        self.enter(ProvisionState::InstanceLaunched);

        let mac = self.deps.virt.mac_address(&spec.name, &config.network)?;
        let outcome = self
            .deps
            .network
            .add_reservation(&config.network, &mac, address, hostname)?;
        info!("Reservation {} -> {} ({:?})", mac, address, outcome);
        self.enter(ProvisionState::AddressRegistered);

        Ok(Launched {
            identity,
            known_hosts_file,
        })
    }

    /// AwaitingGuestReady through Ready, recording the host on success.
    fn await_guest(&mut self, launched: Launched) -> Result<ProvisionReport> {
        self.enter(ProvisionState::AwaitingGuestReady);
        let config = self.config;
        let identity = &launched.identity;
        let target = GuestTarget {
            address: identity.address,
            user: &config.admin_user,
            identity_file: &identity.keypair.private_key_path,
            known_hosts_file: &launched.known_hosts_file,
        };
        let probe = self.deps.probe;
        let readiness = self.deps.readiness;

        let progress = utils::spinner(format!("Waiting for '{}'", identity.name));
        let waited = utils::wait_for_readiness(
            &progress,
            &format!("guest '{}'", identity.name),
            || Ok(probe.is_reachable(target.address)? && readiness.boot_finished(&target)?),
            config.ready_attempts,
            Duration::from_secs(config.ready_interval),
        );
        progress.finish_and_clear();

        let mut report = ProvisionReport {
            state: ProvisionState::Ready,
            name: identity.name.to_string(),
            hostname: identity.hostname.clone(),
            address: identity.address,
            alias: None,
            display: None,
            warning: None,
        };

        match waited {
            Ok(elapsed) => {
                info!("'{}' is ready after {}s", identity.name, elapsed.as_secs());
            }
            Err(e) if e.is_non_fatal() => {
                warn!("{}; leaving the instance running", e);
                self.enter(ProvisionState::Failed);
                report.state = ProvisionState::Failed;
                report.warning = Some(e.to_string());
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        let entry = RegistryEntry {
            alias: identity.hostname.clone(),
            address: identity.address.to_string(),
            user: config.admin_user.clone(),
            identity_file: identity.keypair.private_key_path.clone(),
            known_hosts_file: Some(launched.known_hosts_file.clone()),
        };
        self.deps.registry.upsert(entry)?;
        report.alias = Some(identity.hostname.clone());

        report.display = match self.deps.virt.display_uri(identity.name.as_str()) {
            Ok(display) => display,
            Err(e) => {
                warn!("Could not look up display endpoint: {}", e);
                None
            }
        };
        self.enter(ProvisionState::Ready);
        Ok(report)
    }
}
