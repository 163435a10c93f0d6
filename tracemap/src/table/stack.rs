//! Stack trace extraction from `BPF_MAP_TYPE_STACK_TRACE` maps
//!
//! Stack ids come from a bounded pool shared by every capture event, so a
//! consumer normally clears each id right after reading it. Otherwise the
//! pool fills up and `bpf_get_stackid()` starts failing with `-EEXIST`.

use std::sync::Arc;

use log::{debug, warn};
use tracemap_common::StackTrace;

use super::map_table::MapTable;
use super::MapBackend;
use crate::domain::{Pid, StackId, TableError};
use crate::symbols::{SymbolCache, SymbolOptions, SystemSymbols};

/// Placeholder for addresses nothing could resolve
pub const UNKNOWN_SYMBOL: &str = "[UNKNOWN]";

/// Reads call stacks out of a stack-trace map and symbolizes them
pub struct StackExtractor<B: MapBackend> {
    table: MapTable<B>,
    symbols: SymbolCache,
}

impl<B: MapBackend> StackExtractor<B> {
    /// Wrap a stack-trace table with a system symbol cache using the
    /// table-attached defaults (debug files and CRC checks enabled)
    pub fn new(table: MapTable<B>) -> Self {
        let symbols = SymbolCache::new(Arc::new(SystemSymbols::new()), SymbolOptions::for_table());
        Self::with_symbols(table, symbols)
    }

    pub fn with_symbols(table: MapTable<B>, symbols: SymbolCache) -> Self {
        Self { table, symbols }
    }

    pub fn table(&self) -> &MapTable<B> {
        &self.table
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolCache {
        &mut self.symbols
    }

    /// Read the addresses of a stack, innermost frame first
    ///
    /// Ids `<= 0` mean no stack was captured and yield an empty list without
    /// touching the map. With `clear`, the id is deleted after the read
    /// whether or not the read succeeded.
    ///
    /// # Errors
    /// Returns [`TableError::Lookup`] if the stack id is not in the map
    pub fn try_resolve_stack(&self, stack_id: StackId, clear: bool) -> Result<Vec<u64>, TableError> {
        if !stack_id.is_captured() {
            return Ok(Vec::new());
        }

        let key = stack_id.as_map_key();
        let read = self.table.get(&key);
        if clear {
            self.release(stack_id, &key);
        }
        Ok(decode_stack(&read?))
    }

    /// Like [`try_resolve_stack`](Self::try_resolve_stack), but a failed read
    /// yields an empty stack
    pub fn resolve_stack(&self, stack_id: StackId, clear: bool) -> Vec<u64> {
        self.try_resolve_stack(stack_id, clear).unwrap_or_else(|e| {
            debug!("Stack {} unavailable: {e}", stack_id.0);
            Vec::new()
        })
    }

    /// Return a stack id to the kernel's pool without reading it
    pub fn clear_stack_id(&self, stack_id: StackId) {
        if stack_id.is_captured() {
            self.release(stack_id, &stack_id.as_map_key());
        }
    }

    fn release(&self, stack_id: StackId, key: &[u8]) {
        match self.table.delete(key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Stack {} already released", stack_id.0),
            Err(e) => warn!("Failed to release stack {}: {e}", stack_id.0),
        }
    }

    /// Bare symbol name for `addr`, or `[UNKNOWN]`
    pub fn symbol_for(&mut self, pid: Pid, addr: u64) -> String {
        self.symbols.symbol_name(pid, addr).unwrap_or_else(|| UNKNOWN_SYMBOL.to_string())
    }

    /// Read a stack and resolve every frame, with module/address fallbacks
    pub fn symbolize_stack(&mut self, stack_id: StackId, pid: Pid, clear: bool) -> Vec<String> {
        self.resolve_stack(stack_id, clear)
            .into_iter()
            .map(|addr| self.symbols.resolve(pid, addr))
            .collect()
    }
}

/// Interpret a stack-trace leaf as native-endian addresses, stopping at the
/// first zero entry
#[must_use]
pub fn decode_stack(leaf: &[u8]) -> Vec<u64> {
    let mut trace = StackTrace::default();
    for (slot, chunk) in trace.ip.iter_mut().zip(leaf.chunks_exact(8)) {
        let mut ip = [0u8; 8];
        ip.copy_from_slice(chunk);
        *slot = u64::from_ne_bytes(ip);
    }
    trace.frames().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracemap_common::MAX_STACK_DEPTH;

    fn leaf(ips: &[u64]) -> Vec<u8> {
        let mut bytes = vec![0u8; StackTrace::SIZE];
        for (i, ip) in ips.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&ip.to_ne_bytes());
        }
        bytes
    }

    #[test]
    fn test_decode_stops_at_first_zero() {
        assert_eq!(decode_stack(&leaf(&[0xAA, 0xBB, 0, 0xCC])), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_full_stack() {
        let ips: Vec<u64> = (1..=MAX_STACK_DEPTH as u64).collect();
        assert_eq!(decode_stack(&leaf(&ips)).len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_decode_empty_leaf() {
        assert!(decode_stack(&leaf(&[])).is_empty());
    }
}
