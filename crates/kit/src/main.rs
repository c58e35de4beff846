//! vmup - provision a libvirt VM from a cloud image in one command

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod cache_metadata;
mod cloud_init;
mod command_run;
mod common_opts;
mod create;
mod credentials;
mod error;
mod images;
mod libvirt;
mod network;
mod paths;
mod provision;
mod readiness;
mod ssh_config;
mod utils;
mod vm;

/// Provision virtual machines on libvirt.
///
/// `vmup create` picks a free address on a libvirt network, generates an SSH
/// keypair, renders cloud-init documents, launches the VM with a static DHCP
/// reservation and, once the guest has finished first boot, records an alias
/// for it in your SSH client configuration.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and boot a new VM
    Create(create::CreateOpts),

    /// Print the next free address of a network
    Allocate(network::allocator::AllocateOpts),

    /// Manage host entries in an SSH client configuration file
    #[clap(name = "ssh-config")]
    SshConfig(ssh_config::SshConfigOpts),

    /// Manage the base image cache
    Images {
        /// Base image cache directory
        #[clap(long, global = true, default_value_t = paths::image_dir())]
        image_dir: Utf8PathBuf,

        #[command(subcommand)]
        command: images::ImagesOpts,
    },
}

/// Install and configure the tracing/logging system.
///
/// Sets up structured logging with environment-based filtering,
/// error layer integration, and console output formatting.
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Create(opts) => create::run(opts)?,
        Commands::Allocate(opts) => network::allocator::run(opts)?,
        Commands::SshConfig(opts) => opts.run(paths::ssh_config())?,
        Commands::Images { image_dir, command } => {
            let downloader = images::CurlDownloader;
            let cache = images::ImageCache::new(image_dir, &downloader);
            command.run(&cache)?
        }
    }
    tracing::debug!("exiting");
    Ok(())
}
