//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::symbols::SymbolOptions;

#[derive(Parser, Debug)]
#[command(
    name = "tracemap",
    version,
    about = "Inspect loaded BPF maps and resolve captured addresses to symbols",
    after_help = "\
EXAMPLES:
    sudo tracemap maps                                  List loaded maps
    sudo tracemap dump --name counts --layout l.json    Print entries with a layout
    sudo tracemap stack --name stack_traces 42 --pid 1234
    tracemap symbolize --pid 1234 0x55d4a8e28010
    tracemap symbols c --pattern '^mall'"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List maps currently loaded in the kernel
    Maps,

    /// Print every entry of a map
    Dump {
        #[command(flatten)]
        table: TableArgs,
    },

    /// Delete every entry of a map
    Clear {
        #[command(flatten)]
        table: TableArgs,
    },

    /// Read a stack from a stack-trace map and symbolize it
    Stack {
        #[command(flatten)]
        table: TableArgs,

        /// Stack id returned by bpf_get_stackid()
        #[arg(allow_negative_numbers = true)]
        stack_id: i64,

        /// Process the stack belongs to (omit for a kernel stack)
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        pid: i32,

        /// Release the stack id after reading it
        #[arg(long)]
        clear: bool,

        #[command(flatten)]
        symbols: SymbolArgs,
    },

    /// Resolve addresses in a process (-1 for kernel addresses)
    Symbolize {
        #[arg(short, long, allow_negative_numbers = true)]
        pid: i32,

        /// Addresses, hex with 0x prefix or decimal
        #[arg(required = true, value_parser = parse_address)]
        addresses: Vec<u64>,

        #[command(flatten)]
        symbols: SymbolArgs,
    },

    /// List function symbols of a module, optionally filtered by a regex
    Symbols {
        /// Library name ("c"), path, or "kernel"
        module: String,

        #[arg(long)]
        pattern: Option<String>,
    },

    /// Find the address and file offset of a named symbol
    Locate {
        module: String,
        symbol: String,

        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        pid: i32,
    },
}

/// Which map to operate on
#[derive(ClapArgs, Debug)]
pub struct TableArgs {
    /// Kernel map id
    #[arg(long, conflicts_with = "name", required_unless_present = "name")]
    pub id: Option<u32>,

    /// Map name as reported by the kernel
    #[arg(long)]
    pub name: Option<String>,

    /// JSON file mapping table names to key/leaf layout descriptors
    #[arg(long, value_name = "FILE")]
    pub layout: Option<PathBuf>,
}

/// Resolver options
#[derive(ClapArgs, Debug, Default)]
pub struct SymbolArgs {
    /// Look for separate debug files of stripped modules
    #[arg(long)]
    pub use_debug_file: bool,

    /// Verify the CRC of debug files found through .gnu_debuglink
    #[arg(long, requires = "use_debug_file")]
    pub check_debug_crc: bool,

    /// Parse every mapped module up front instead of on first use
    #[arg(long)]
    pub eager: bool,
}

impl SymbolArgs {
    /// The default resolver options with these flags applied
    #[must_use]
    pub fn options(&self) -> SymbolOptions {
        self.apply(SymbolOptions::default())
    }

    /// Turn on whatever the flags ask for on top of `base`
    #[must_use]
    pub fn apply(&self, base: SymbolOptions) -> SymbolOptions {
        base.with_debug_file(base.use_debug_file || self.use_debug_file)
            .with_debug_file_crc(base.check_debug_file_crc || self.check_debug_crc)
            .with_lazy_symbolize(base.lazy_symbolize && !self.eager)
    }
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x1f").unwrap(), 0x1f);
        assert_eq!(parse_address("31").unwrap(), 31);
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn test_symbolize_args() {
        let args = Args::parse_from(["tracemap", "symbolize", "--pid", "12", "0x10", "32", "--eager"]);
        match args.command {
            Command::Symbolize { pid, addresses, symbols } => {
                assert_eq!(pid, 12);
                assert_eq!(addresses, vec![0x10, 32]);
                assert!(!symbols.options().lazy_symbolize);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flags_only_add_to_base() {
        let flags = SymbolArgs { use_debug_file: false, check_debug_crc: false, eager: true };
        let opts = flags.apply(SymbolOptions::for_table());
        assert!(opts.use_debug_file && opts.check_debug_file_crc);
        assert!(!opts.lazy_symbolize);
    }

    #[test]
    fn test_table_requires_id_or_name() {
        assert!(Args::try_parse_from(["tracemap", "dump"]).is_err());
        assert!(Args::try_parse_from(["tracemap", "dump", "--id", "3", "--name", "x"]).is_err());
        assert!(Args::try_parse_from(["tracemap", "clear", "--name", "counts"]).is_ok());
    }

    #[test]
    fn test_stack_defaults_to_kernel() {
        let args = Args::parse_from(["tracemap", "stack", "--id", "7", "42"]);
        match args.command {
            Command::Stack { stack_id, pid, clear, .. } => {
                assert_eq!((stack_id, pid, clear), (42, -1, false));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
