//! Process-wide function symbol listings per module
//!
//! Probe attachment searches a module's symbols by pattern, often many times
//! per module. The first search scans the module once; later searches reuse
//! the stored listing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info};
use regex::Regex;

use super::kallsyms::is_kernel_module;
use super::{SymbolBackend, SymbolLocation, SymbolOptions, SystemSymbols};
use crate::domain::{Pid, SymbolError};

/// A function symbol's raw name and address within its module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolAddress {
    pub name: String,
    pub address: u64,
}

/// Cache of every function symbol of each module looked at
///
/// One lock covers the whole index. Each scan fills a buffer owned by the
/// call and is only published once complete.
pub struct SymbolModuleIndex {
    backend: Arc<dyn SymbolBackend>,
    modules: Mutex<HashMap<String, Arc<[SymbolAddress]>>>,
}

impl SymbolModuleIndex {
    pub fn new(backend: Arc<dyn SymbolBackend>) -> Self {
        Self { backend, modules: Mutex::new(HashMap::new()) }
    }

    /// Shared index over [`SystemSymbols`]
    pub fn global() -> &'static SymbolModuleIndex {
        static GLOBAL: OnceLock<SymbolModuleIndex> = OnceLock::new();
        GLOBAL.get_or_init(|| SymbolModuleIndex::new(Arc::new(SystemSymbols::new())))
    }

    /// Every function symbol of `module`, in enumeration order
    ///
    /// The first call per module scans it while holding the index lock, so
    /// concurrent first calls still scan once. Failed scans are not cached.
    ///
    /// # Errors
    /// Returns the backend's error if the module cannot be enumerated
    pub fn list_symbols(&self, module: &str) -> Result<Arc<[SymbolAddress]>, SymbolError> {
        let mut modules = self.modules.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(symbols) = modules.get(module) {
            return Ok(Arc::clone(symbols));
        }

        let mut scanned = Vec::new();
        self.backend.for_each_function_symbol(module, &mut |name, address| {
            scanned.push(SymbolAddress { name: name.to_string(), address });
        })?;
        info!("Indexed {} function symbols in {module}", scanned.len());

        let symbols: Arc<[SymbolAddress]> = scanned.into();
        modules.insert(module.to_string(), Arc::clone(&symbols));
        Ok(symbols)
    }

    /// Symbols of `module` whose name matches the regular expression
    /// `pattern`, in listing order
    ///
    /// # Errors
    /// Returns [`SymbolError::InvalidPattern`] before touching the module if
    /// the expression does not compile
    pub fn match_symbols(&self, module: &str, pattern: &str) -> Result<Vec<SymbolAddress>, SymbolError> {
        let re = Regex::new(pattern)
            .map_err(|source| SymbolError::InvalidPattern { pattern: pattern.to_string(), source })?;
        let matched: Vec<SymbolAddress> =
            self.list_symbols(module)?.iter().filter(|s| re.is_match(&s.name)).cloned().collect();
        debug!("{} symbols in {module} match {pattern}", matched.len());
        Ok(matched)
    }

    /// Module path and file offset of a named symbol
    ///
    /// Uses a resolver handle opened for this call only.
    ///
    /// # Errors
    /// Returns [`SymbolError::NotFound`] if the symbol cannot be located
    pub fn resolve_address_for_name(&self, module: &str, name: &str, pid: Pid) -> Result<(String, u64), SymbolError> {
        let location = self.locate(module, name, pid)?;
        Ok((location.module, location.offset))
    }

    /// Address of a named symbol: the runtime address when `pid` maps the
    /// module, otherwise the symbol's virtual address in the file
    ///
    /// # Errors
    /// Returns [`SymbolError::NotFound`] if the symbol cannot be located
    pub fn resolve_name_to_address(&self, module: &str, name: &str, pid: Pid) -> Result<u64, SymbolError> {
        Ok(self.locate(module, name, pid)?.address)
    }

    /// The kernel pid has no mappings, so user modules are read from the
    /// file directly and only the kernel image goes through kallsyms
    fn locate(&self, module: &str, name: &str, pid: Pid) -> Result<SymbolLocation, SymbolError> {
        let not_found = |e: SymbolError| {
            debug!("Locating {name} in {module}: {e}");
            SymbolError::NotFound { module: module.to_string(), name: name.to_string() }
        };
        if pid.normalized().is_kernel() && !module.is_empty() && !is_kernel_module(module) {
            return self.backend.locate_in_module(module, name).map_err(not_found);
        }
        let mut resolver = self.backend.open(pid, &SymbolOptions::default()).map_err(not_found)?;
        resolver.resolve_name(module, name).map_err(not_found)
    }
}
