//! Kernel symbols from /proc/kallsyms

use std::fs;

use log::{debug, warn};

use super::{Resolution, SymbolLocation, SymbolResolver};
use crate::domain::{Pid, SymbolError};

const KALLSYMS: &str = "/proc/kallsyms";

/// Module name reported for symbols of the core kernel image
pub const KERNEL_MODULE: &str = "[kernel]";

/// Whether `module` names the kernel image rather than a file
#[must_use]
pub fn is_kernel_module(module: &str) -> bool {
    module == "kernel" || module == KERNEL_MODULE
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelSymbol {
    address: u64,
    name: String,
    module: String,
}

/// Text symbols of the running kernel, sorted by address
#[derive(Debug, Default)]
pub struct KernelSymbols {
    symbols: Vec<KernelSymbol>,
}

impl KernelSymbols {
    /// Read /proc/kallsyms
    ///
    /// # Errors
    /// Returns [`SymbolError::ResolutionUnavailable`] if the file cannot be read
    pub fn load() -> Result<Self, SymbolError> {
        let text = fs::read_to_string(KALLSYMS).map_err(|e| SymbolError::ResolutionUnavailable {
            pid: Pid::KERNEL,
            reason: format!("failed to read {KALLSYMS}: {e}"),
        })?;
        let symbols = Self::parse(&text);
        if symbols.is_empty() {
            warn!("{KALLSYMS} exposes no addresses; kernel frames will stay unresolved");
        }
        Ok(symbols)
    }

    /// Parse kallsyms text, keeping text (`t`/`T`) and weak (`w`/`W`)
    /// symbols
    ///
    /// When every address reads as zero (kptr_restrict), the table is
    /// treated as empty.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut symbols: Vec<KernelSymbol> = text
            .lines()
            .filter_map(|line| {
                // "ffffffff81000000 T _stext" or "... t fn [module]"
                let mut parts = line.split_whitespace();
                let address = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                if !matches!(kind, "t" | "T" | "w" | "W") {
                    return None;
                }
                let name = parts.next()?.to_string();
                let module = parts.next().map_or_else(|| KERNEL_MODULE.to_string(), str::to_string);
                Some(KernelSymbol { address, name, module })
            })
            .collect();

        if symbols.iter().all(|s| s.address == 0) {
            symbols.clear();
        }
        symbols.sort_by_key(|s| s.address);
        debug!("Parsed {} kernel symbols", symbols.len());
        Self { symbols }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Name, address of every symbol
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols.iter().map(|s| (s.name.as_str(), s.address))
    }
}

impl SymbolResolver for KernelSymbols {
    fn resolve(&mut self, addr: u64) -> Resolution {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        match idx.checked_sub(1).and_then(|i| self.symbols.get(i)) {
            Some(sym) => Resolution::Symbol {
                name: sym.name.clone(),
                module: sym.module.clone(),
                offset: addr - sym.address,
            },
            None => Resolution::Unknown,
        }
    }

    fn resolve_name(&mut self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        let any_module = module.is_empty() || is_kernel_module(module);
        self.symbols
            .iter()
            .find(|s| s.name == name && (any_module || s.module.trim_matches(|c| c == '[' || c == ']') == module))
            .map(|s| SymbolLocation { module: s.module.clone(), address: s.address, offset: 0 })
            .ok_or_else(|| SymbolError::NotFound { module: module.to_string(), name: name.to_string() })
    }
}
