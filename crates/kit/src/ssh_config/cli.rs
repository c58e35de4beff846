use camino::Utf8PathBuf;
use color_eyre::eyre::{Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Table};

use super::{ConfigValidator, NoValidation, Registry, RegistryEntry, SshValidator};

/// Manage host entries in an SSH client configuration file
#[derive(clap::Args, Debug)]
pub(crate) struct SshConfigOpts {
    /// Configuration file to edit (default: ~/.ssh/config)
    #[clap(long, global = true)]
    pub file: Option<Utf8PathBuf>,

    /// Do not validate rewritten files with `ssh -G`
    #[clap(long, global = true)]
    pub skip_validation: bool,

    #[command(subcommand)]
    pub command: SshConfigCommand,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum SshConfigCommand {
    /// Append a new host entry
    Add(EntryArgs),
    /// Replace an existing host entry
    Update(EntryArgs),
    /// Delete a host entry
    Remove {
        #[clap(long)]
        alias: String,
    },
    /// Show concrete host aliases and their connection parameters
    List {
        /// Output as structured JSON instead of table format
        #[clap(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct EntryArgs {
    #[clap(long)]
    pub alias: String,

    /// Target address or host name
    #[clap(long)]
    pub address: String,

    #[clap(long)]
    pub identity_file: Utf8PathBuf,

    #[clap(long, default_value = "admin")]
    pub user: String,

    /// Dedicated known-hosts file for this entry
    #[clap(long)]
    pub known_hosts_file: Option<Utf8PathBuf>,
}

impl From<EntryArgs> for RegistryEntry {
    fn from(args: EntryArgs) -> Self {
        Self {
            alias: args.alias,
            address: args.address,
            user: args.user,
            identity_file: args.identity_file,
            known_hosts_file: args.known_hosts_file,
        }
    }
}

impl SshConfigOpts {
    pub(crate) fn run(self, default_file: Utf8PathBuf) -> Result<()> {
        let file = self.file.unwrap_or(default_file);
        let validator: &dyn ConfigValidator = if self.skip_validation {
            &NoValidation
        } else {
            &SshValidator
        };
        let registry = Registry::new(&file, validator);

        match self.command {
            SshConfigCommand::Add(args) => registry
                .add(args.into())
                .with_context(|| format!("Adding entry to {file}"))?,
            SshConfigCommand::Update(args) => registry
                .update(args.into())
                .with_context(|| format!("Updating entry in {file}"))?,
            SshConfigCommand::Remove { alias } => registry
                .remove(&alias)
                .with_context(|| format!("Removing entry from {file}"))?,
            SshConfigCommand::List { json } => {
                let hosts = registry
                    .list()
                    .with_context(|| format!("Reading {file}"))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&hosts)?);
                    return Ok(());
                }
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_header(vec!["ALIAS", "ADDRESS", "USER", "IDENTITY FILE"]);
                for host in hosts {
                    table.add_row(vec![
                        host.alias,
                        host.address.unwrap_or_default(),
                        host.user.unwrap_or_default(),
                        host.identity_file.unwrap_or_default(),
                    ]);
                }
                println!("{}", table);
            }
        }
        Ok(())
    }
}
