//! `vmup create`: wire the real collaborators into a [`Provisioner`].

use std::time::Duration;

use color_eyre::eyre::{Context as _, Result};
use tracing::warn;

use crate::common_opts::MemoryOpts;
use crate::credentials::{KeyStore, SshKeygen};
use crate::images::{CurlDownloader, ImageCache};
use crate::libvirt::Virsh;
use crate::network::allocator::PingProbe;
use crate::provision::{Collaborators, ProvisionConfig, ProvisionState, Provisioner, VmRequest};
use crate::readiness::SshReadiness;
use crate::ssh_config::{Registry, SshValidator};
use crate::vm::VmName;

/// Create a VM from a cloud image and record it in the SSH configuration
#[derive(clap::Args, Debug)]
pub(crate) struct CreateOpts {
    /// Name of the libvirt domain (also the default hostname and SSH alias)
    #[clap(long)]
    pub name: VmName,

    /// Guest hostname (default: derived from the name)
    #[clap(long)]
    pub hostname: Option<String>,

    /// OS identifier from the image catalog
    #[clap(long, default_value = "ubuntu-24.04")]
    pub os: String,

    #[clap(flatten)]
    pub memory: MemoryOpts,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 2)]
    pub vcpus: u32,

    /// Disk size (e.g. 20G)
    #[clap(long, default_value = "20G")]
    pub disk_size: String,

    /// Destroy and undefine an existing instance with the same name
    #[clap(long)]
    pub replace: bool,

    /// Print the result as JSON
    #[clap(long)]
    pub json: bool,

    #[clap(flatten)]
    pub config: ProvisionConfig,
}

impl CreateOpts {
    fn request(&self) -> Result<VmRequest> {
        Ok(VmRequest {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            os: self.os.clone(),
            memory_mb: self.memory.memory_mb()?,
            vcpus: self.vcpus,
            disk_size: crate::utils::parse_size(&self.disk_size)
                .with_context(|| format!("Parsing --disk-size {}", self.disk_size))?,
            replace: self.replace,
        })
    }
}

pub(crate) fn run(opts: CreateOpts) -> Result<()> {
    let request = opts.request()?;
    let config = &opts.config;

    let downloader = CurlDownloader;
    let images = ImageCache::new(&config.image_dir, &downloader);
    let virsh = Virsh::new(config.connect.clone());
    let probe = PingProbe {
        timeout: Duration::from_secs(config.probe_timeout),
    };
    let keygen = SshKeygen;
    let keys = KeyStore::new(&config.keys_dir, &keygen);
    let readiness = SshReadiness {
        connect_timeout: Duration::from_secs(config.probe_timeout.max(5)),
    };
    let validator = SshValidator;
    let registry = Registry::new(&config.ssh_config, &validator);

    let deps = Collaborators {
        images: &images,
        virt: &virsh,
        network: &virsh,
        probe: &probe,
        keys: &keys,
        readiness: &readiness,
        registry: &registry,
    };
    let mut provisioner = Provisioner::new(config, deps);
    let report = provisioner
        .run(&request)
        .with_context(|| format!("Provisioning '{}'", request.name))?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match report.state {
        ProvisionState::Ready => {
            println!("{} is ready at {}", report.name, report.address);
            if let Some(alias) = &report.alias {
                println!("Connect with: ssh {alias}");
            }
            if let Some(display) = &report.display {
                println!("Display: {display}");
            }
        }
        _ => {
            // The instance keeps booting on its own
            if let Some(warning) = &report.warning {
                warn!("{}", warning);
            }
            println!(
                "{} was launched at {} but did not report ready; it has been left running",
                report.name, report.address
            );
        }
    }
    Ok(())
}
