//! Common CLI options shared across commands

use clap::Parser;

use crate::error::Result;

pub const DEFAULT_MEMORY_USER_STR: &str = "2048M";

/// Memory size options
#[derive(Parser, Debug, Clone, Default)]
pub struct MemoryOpts {
    #[clap(
        long,
        default_value = DEFAULT_MEMORY_USER_STR,
        help = "Memory size (e.g. 4G, 2048M, or plain number for MB)"
    )]
    pub memory: String,
}

impl MemoryOpts {
    pub fn memory_mb(&self) -> Result<u32> {
        crate::utils::parse_memory_to_mb(&self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_memory() {
        #[derive(Parser)]
        struct Cli {
            #[clap(flatten)]
            memory: MemoryOpts,
        }
        let cli = Cli::parse_from(["vmup"]);
        assert_eq!(cli.memory.memory_mb().unwrap(), 2048);
        let cli = Cli::parse_from(["vmup", "--memory", "4G"]);
        assert_eq!(cli.memory.memory, "4G");
        assert_eq!(cli.memory.memory_mb().unwrap(), 4096);
    }
}
