//! Per-process resolver handles

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use super::{format_address, Resolution, SymbolBackend, SymbolOptions, SymbolResolver, SystemSymbols};
use crate::domain::{Pid, SymbolError};

/// Resolver handles keyed by process
///
/// A handle is created the first time a pid is resolved and lives until
/// [`release`](Self::release) is called for it. Handles pin resources of
/// the traced process, so callers release them when the process exits.
/// Any negative pid shares the single kernel handle.
///
/// A pid whose handle cannot be opened (usually an exited process) is
/// remembered as unavailable until it is released, so a long stack costs
/// one failed open rather than one per frame.
pub struct SymbolCache {
    backend: Arc<dyn SymbolBackend>,
    options: SymbolOptions,
    handles: HashMap<Pid, Box<dyn SymbolResolver>>,
    unavailable: HashMap<Pid, String>,
}

impl SymbolCache {
    pub fn new(backend: Arc<dyn SymbolBackend>, options: SymbolOptions) -> Self {
        Self { backend, options, handles: HashMap::new(), unavailable: HashMap::new() }
    }

    /// Cache over [`SystemSymbols`] with the default (lazy, no debug file)
    /// options
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemSymbols::new()), SymbolOptions::default())
    }

    #[must_use]
    pub fn options(&self) -> &SymbolOptions {
        &self.options
    }

    /// Handle for `pid`, opening one if absent
    ///
    /// # Errors
    /// Returns the backend's error when no handle can be opened, and
    /// [`SymbolError::ResolutionUnavailable`] for a pid that already failed
    /// and has not been released since
    pub fn get_or_create(&mut self, pid: Pid) -> Result<&mut dyn SymbolResolver, SymbolError> {
        let pid = pid.normalized();
        if let Some(reason) = self.unavailable.get(&pid) {
            return Err(SymbolError::ResolutionUnavailable { pid, reason: reason.clone() });
        }
        let handle = match self.handles.entry(pid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.backend.open(pid, &self.options) {
                Ok(handle) => {
                    debug!("Created symbol resolver for {pid}");
                    entry.insert(handle)
                }
                Err(e) => {
                    warn!("No symbol resolver for {pid}: {e}");
                    self.unavailable.insert(pid, e.to_string());
                    return Err(e);
                }
            },
        };
        Ok(handle.as_mut())
    }

    /// Resolve an address, keeping the full outcome
    ///
    /// # Errors
    /// Returns an error if no handle can be opened for `pid`
    pub fn try_resolve(&mut self, pid: Pid, addr: u64) -> Result<Resolution, SymbolError> {
        Ok(self.get_or_create(pid)?.resolve(addr))
    }

    /// Resolve an address to display text
    ///
    /// Returns the demangled symbol name, `[m] <module> + 0x%08x` when only the
    /// containing module is known, or `0x%016x` otherwise.
    pub fn resolve(&mut self, pid: Pid, addr: u64) -> String {
        match self.try_resolve(pid, addr) {
            Ok(resolution) => resolution.display(addr),
            Err(e) => {
                debug!("Cannot resolve 0x{addr:x} for {pid}: {e}");
                format_address(addr)
            }
        }
    }

    /// Bare symbol name, without module or address fallbacks
    pub fn symbol_name(&mut self, pid: Pid, addr: u64) -> Option<String> {
        match self.try_resolve(pid, addr) {
            Ok(Resolution::Symbol { name, .. }) => Some(name),
            Ok(_) => None,
            Err(e) => {
                debug!("No resolver for {pid}: {e}");
                None
            }
        }
    }

    /// Drop the handle for `pid`; returns whether one was cached
    ///
    /// Also forgets an earlier failure to open one. Releasing a pid with no
    /// handle is a no-op.
    pub fn release(&mut self, pid: Pid) -> bool {
        let pid = pid.normalized();
        self.unavailable.remove(&pid);
        let released = self.handles.remove(&pid).is_some();
        if released {
            debug!("Released symbol resolver for {pid}");
        }
        released
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.handles.contains_key(&pid.normalized())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
