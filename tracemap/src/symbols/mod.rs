//! # Symbol Resolution and Address Translation
//!
//! Converts instruction pointers captured by BPF programs into symbol names.
//!
//! ## Pieces
//!
//! - [`SymbolBackend`] / [`SymbolResolver`]: capability traits. A backend
//!   opens one resolver handle per process; the handle owns whatever it
//!   needs (parsed symbol tables, memory maps) and releases it on drop.
//! - [`SymbolCache`]: per-process handles created on first use and evicted
//!   explicitly when the traced process exits.
//! - [`SymbolModuleIndex`]: process-wide cache of every function symbol in a
//!   module, for pattern searches when attaching probes.
//! - [`SystemSymbols`]: the backend used in production, built on ELF
//!   symbol tables, `/proc/<pid>/maps` and `/proc/kallsyms`.
//!
//! ## Output Format
//!
//! | Outcome                         | Text                           |
//! |---------------------------------|--------------------------------|
//! | Function symbol found           | demangled name                 |
//! | Inside a mapped module only     | `[m] <module> + 0x%08x`        |
//! | Nothing known                   | `0x%016x`                      |
//!
//! ## Address Translation Flow
//!
//! ```text
//! 1. Find the mapping containing the address in /proc/<pid>/maps
//!    7f3a1c000000-7f3a1c1b0000 r-xp 00028000 ... /usr/lib/libc.so.6
//!
//! 2. Convert to a file offset
//!    file_offset = addr - mapping.start + mapping.offset
//!
//! 3. Convert to an ELF virtual address using the PT_LOAD segments
//!
//! 4. Binary search the module's function symbols and demangle
//! ```
//!
//! Pid `-1` resolves against the running kernel via `/proc/kallsyms`.

use crate::domain::{Pid, SymbolError};

pub mod cache;
pub mod debuginfo;
pub mod elf;
pub mod index;
pub mod kallsyms;
pub mod memory_maps;
pub mod options;
pub mod system;

pub use cache::SymbolCache;
pub use elf::ElfSymbols;
pub use index::{SymbolAddress, SymbolModuleIndex};
pub use memory_maps::{parse_maps, Mapping, MemoryRange};
pub use options::{SymbolOptions, SymbolTypes};
pub use system::SystemSymbols;

/// Outcome of resolving one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A function symbol covers the address
    Symbol { name: String, module: String, offset: u64 },
    /// The address is inside a known module, but no symbol covers it
    Module { module: String, offset: u64 },
    /// Nothing is mapped at the address
    Unknown,
}

impl Resolution {
    /// Render with the module and raw-address fallbacks
    #[must_use]
    pub fn display(&self, addr: u64) -> String {
        match self {
            Self::Symbol { name, .. } => name.clone(),
            Self::Module { module, offset } => format_module(module, *offset),
            Self::Unknown => format_address(addr),
        }
    }
}

/// Where a named symbol lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolLocation {
    /// Resolved path of the module containing the symbol
    pub module: String,
    /// Runtime address when the module is mapped in the process, otherwise
    /// the symbol's ELF virtual address
    pub address: u64,
    /// Offset of the symbol within the module file
    pub offset: u64,
}

/// One process's view of its symbols
///
/// Dropping the handle releases everything it holds.
pub trait SymbolResolver: Send {
    /// Resolve an address in this process's address space
    fn resolve(&mut self, addr: u64) -> Resolution;

    /// Find a symbol by name within `module` (a path or a library name)
    ///
    /// # Errors
    /// Returns [`SymbolError::ModuleNotFound`] or [`SymbolError::NotFound`]
    fn resolve_name(&mut self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError>;
}

/// Source of resolver handles and module symbol listings
pub trait SymbolBackend: Send + Sync {
    /// Open a resolver handle for `pid` (`Pid::KERNEL` for kernel space)
    ///
    /// # Errors
    /// Returns [`SymbolError::ResolutionUnavailable`] if the process is gone
    /// or its maps are unreadable
    fn open(&self, pid: Pid, options: &SymbolOptions) -> Result<Box<dyn SymbolResolver>, SymbolError>;

    /// Call `visit` with the raw name and address of every function symbol
    /// in `module`
    ///
    /// # Errors
    /// Returns an error if the module cannot be found or parsed
    fn for_each_function_symbol(
        &self,
        module: &str,
        visit: &mut dyn FnMut(&str, u64),
    ) -> Result<(), SymbolError>;

    /// Find a symbol in a user-space module without any process mappings
    ///
    /// The address is the symbol's ELF virtual address.
    ///
    /// # Errors
    /// Returns [`SymbolError::ModuleNotFound`] or [`SymbolError::NotFound`]
    fn locate_in_module(&self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError>;
}

/// `0x%016x`
#[must_use]
pub fn format_address(addr: u64) -> String {
    format!("0x{addr:016x}")
}

/// `[m] <module> + 0x%08x`
#[must_use]
pub fn format_module(module: &str, offset: u64) -> String {
    format!("[m] {module} + 0x{offset:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_address_is_zero_padded() {
        assert_eq!(format_address(0xdead), "0x000000000000dead");
    }

    #[test]
    fn test_format_module() {
        assert_eq!(format_module("/usr/lib/libc.so.6", 0x1f0), "[m] /usr/lib/libc.so.6 + 0x000001f0");
    }

    #[test]
    fn test_resolution_display_priority() {
        let symbol = Resolution::Symbol {
            name: "main".to_string(),
            module: "/bin/app".to_string(),
            offset: 4,
        };
        assert_eq!(symbol.display(0x10), "main");
        assert_eq!(Resolution::Unknown.display(0x10), "0x0000000000000010");
    }
}
