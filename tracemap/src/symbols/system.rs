//! Resolver backend for the running system
//!
//! User space handles map addresses through `/proc/<pid>/maps` into module
//! files and look them up in ELF symbol tables. `Pid::KERNEL` gets a handle
//! over `/proc/kallsyms`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::elf::{demangle_symbol, ElfSymbols};
use super::kallsyms::{is_kernel_module, KernelSymbols};
use super::memory_maps::{find_mapping, host_path, read_process_maps, Mapping};
use super::{Resolution, SymbolBackend, SymbolLocation, SymbolOptions, SymbolResolver};
use crate::domain::{Pid, SymbolError};

const DEFAULT_LIB_DIRS: &[&str] = &[
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/local/lib",
];

/// Symbol backend over ELF files, process maps and kallsyms
#[derive(Debug, Clone)]
pub struct SystemSymbols {
    lib_dirs: Vec<PathBuf>,
}

impl Default for SystemSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSymbols {
    #[must_use]
    pub fn new() -> Self {
        Self::with_lib_dirs(DEFAULT_LIB_DIRS.iter().map(PathBuf::from).collect())
    }

    /// Search `lib_dirs` instead of the standard library directories when a
    /// library name is not mapped by the process
    #[must_use]
    pub fn with_lib_dirs(lib_dirs: Vec<PathBuf>) -> Self {
        Self { lib_dirs }
    }
}

impl SymbolBackend for SystemSymbols {
    fn open(&self, pid: Pid, options: &SymbolOptions) -> Result<Box<dyn SymbolResolver>, SymbolError> {
        let pid = pid.normalized();
        if pid.is_kernel() {
            debug!("Opening kernel symbol resolver");
            return Ok(Box::new(KernelSymbols::load()?));
        }
        Ok(Box::new(ProcessResolver::open(pid, *options, self.lib_dirs.clone())?))
    }

    fn for_each_function_symbol(
        &self,
        module: &str,
        visit: &mut dyn FnMut(&str, u64),
    ) -> Result<(), SymbolError> {
        if is_kernel_module(module) {
            KernelSymbols::load()?.iter().for_each(|(name, addr)| visit(name, addr));
            return Ok(());
        }

        let path = resolve_module_path(module, &[], &self.lib_dirs)?;
        let symbols = ElfSymbols::load(Path::new(&path), &SymbolOptions::default()).map_err(|e| {
            SymbolError::Enumeration { module: module.to_string(), reason: e.to_string() }
        })?;
        for sym in symbols.iter() {
            visit(&sym.name, sym.address);
        }
        Ok(())
    }

    fn locate_in_module(&self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        let path = resolve_module_path(module, &[], &self.lib_dirs)?;
        let not_found = || SymbolError::NotFound { module: module.to_string(), name: name.to_string() };

        let elf = ElfSymbols::load(Path::new(&path), &SymbolOptions::default()).map_err(|e| {
            debug!("Loading {path}: {e}");
            not_found()
        })?;
        let sym = elf.find_by_name(name).ok_or_else(not_found)?;
        let offset = elf.vaddr_to_file_offset(sym.address).unwrap_or(sym.address);
        Ok(SymbolLocation { module: path, address: sym.address, offset })
    }
}

/// Resolver handle for one user-space process
pub struct ProcessResolver {
    pid: Pid,
    options: SymbolOptions,
    mappings: Vec<Mapping>,
    lib_dirs: Vec<PathBuf>,
    /// `None` records a module that failed to load, so it is not retried
    modules: HashMap<String, Option<ElfSymbols>>,
}

impl ProcessResolver {
    /// Snapshot the process's mappings; with eager symbolization every
    /// executable module is parsed immediately
    ///
    /// # Errors
    /// Returns [`SymbolError::ResolutionUnavailable`] if the maps cannot be read
    pub fn open(pid: Pid, options: SymbolOptions, lib_dirs: Vec<PathBuf>) -> Result<Self, SymbolError> {
        let mappings = read_process_maps(pid)?;
        let mut resolver = Self { pid, options, mappings, lib_dirs, modules: HashMap::new() };

        if !options.lazy_symbolize {
            let mut paths: Vec<String> = resolver
                .mappings
                .iter()
                .filter(|m| m.is_executable())
                .map(|m| m.path.clone())
                .collect();
            paths.dedup();
            for path in paths {
                resolver.module(&path);
            }
            debug!("{pid}: eagerly loaded {} modules", resolver.modules.len());
        }
        Ok(resolver)
    }

    fn module(&mut self, path: &str) -> Option<&ElfSymbols> {
        if !self.modules.contains_key(path) {
            let loaded = match ElfSymbols::load(&host_path(self.pid, path), &self.options) {
                Ok(symbols) => Some(symbols),
                Err(e) => {
                    debug!("{}: no symbols for {path}: {e}", self.pid);
                    None
                }
            };
            self.modules.insert(path.to_string(), loaded);
        }
        self.modules.get(path).and_then(Option::as_ref)
    }
}

impl SymbolResolver for ProcessResolver {
    fn resolve(&mut self, addr: u64) -> Resolution {
        let Some(mapping) = find_mapping(&self.mappings, addr) else {
            return Resolution::Unknown;
        };
        let module = mapping.path.clone();
        let file_offset = mapping.file_offset(addr);

        let found = self.module(&module).and_then(|elf| {
            let vaddr = elf.file_offset_to_vaddr(file_offset)?;
            elf.lookup(vaddr).map(|(sym, offset)| (demangle_symbol(&sym.name), offset))
        });
        match found {
            Some((name, offset)) => Resolution::Symbol { name, module, offset },
            None => Resolution::Module { module, offset: file_offset },
        }
    }

    fn resolve_name(&mut self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        let path = resolve_module_path(module, &self.mappings, &self.lib_dirs)?;
        let not_found = || SymbolError::NotFound { module: module.to_string(), name: name.to_string() };

        let elf = self.module(&path).ok_or_else(not_found)?;
        let sym = elf.find_by_name(name).ok_or_else(not_found)?;
        let offset = elf.vaddr_to_file_offset(sym.address).unwrap_or(sym.address);
        let vaddr = sym.address;

        let address = self
            .mappings
            .iter()
            .find(|m| m.path == path && offset >= m.offset && offset - m.offset < m.range.end - m.range.start)
            .map_or(vaddr, |m| m.range.start + (offset - m.offset));
        Ok(SymbolLocation { module: path, address, offset })
    }
}

/// Resolve a module reference to a file path
///
/// Paths (anything containing `/`) are taken as given. Library names such as
/// `"c"` or `"libc.so.6"` are looked up in the process's mappings, then in
/// `lib_dirs`, and finally executables are searched on `PATH`.
///
/// # Errors
/// Returns [`SymbolError::ModuleNotFound`] if nothing matches
pub fn resolve_module_path(
    module: &str,
    mappings: &[Mapping],
    lib_dirs: &[PathBuf],
) -> Result<String, SymbolError> {
    if module.contains('/') {
        return if Path::new(module).exists() || mappings.iter().any(|m| m.path == module) {
            Ok(module.to_string())
        } else {
            Err(SymbolError::ModuleNotFound(module.to_string()))
        };
    }

    if let Some(mapping) = mappings.iter().find(|m| file_name(&m.path).is_some_and(|f| matches_library(f, module))) {
        return Ok(mapping.path.clone());
    }

    for dir in lib_dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| file_name(&p.to_string_lossy()).is_some_and(|f| matches_library(f, module)))
            .collect();
        // Shortest name first: libc.so.6 before libc.so.6.debug
        matches.sort_by_key(|p| p.as_os_str().len());
        if let Some(found) = matches.into_iter().next() {
            return Ok(found.to_string_lossy().into_owned());
        }
    }

    if let Some(paths) = env::var_os("PATH") {
        if let Some(found) = env::split_paths(&paths).map(|d| d.join(module)).find(|p| p.is_file()) {
            return Ok(found.to_string_lossy().into_owned());
        }
    }

    warn!("Could not resolve module {module}");
    Err(SymbolError::ModuleNotFound(module.to_string()))
}

fn file_name(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|f| !f.is_empty())
}

/// `"c"` matches `libc.so*` and `libc-2.31.so`; `"libc.so.6"` matches
/// itself and versioned names below it
fn matches_library(file: &str, module: &str) -> bool {
    if module.contains(".so") {
        return file == module || file.strip_prefix(module).is_some_and(|rest| rest.starts_with('.'));
    }
    let stem = if module.starts_with("lib") { module.to_string() } else { format!("lib{module}") };
    file.strip_prefix(&stem)
        .is_some_and(|rest| rest.starts_with(".so") || (rest.starts_with('-') && rest.contains(".so")))
}
