//! # Kernel Map Tables
//!
//! A [`MapTable`] is a byte-exact conduit to one kernel BPF map. Keys and
//! leaves are never typed here: the real struct layout lives in the compiled
//! instrumentation program, so the table only moves buffers whose sizes come
//! from the map's [`MapDescriptor`]. Rendering bytes as text is delegated to a
//! [`FieldFormatter`] supplied alongside the table.
//!
//! ## Backends
//!
//! All kernel traffic goes through the [`MapBackend`] capability trait:
//!
//! - [`KernelMap`]: a map fd owned through aya, driven with raw `bpf(2)`
//!   element commands
//! - [`MemoryMap`]: an in-process map with hash-map semantics, used by tests
//!   and for replaying captured data
//!
//! ## Per-CPU Maps
//!
//! Per-CPU hash and array maps hold one value per *possible* CPU. The kernel
//! copies all of them on lookup, each slot rounded up to 8 bytes, so the leaf
//! buffer is `round_up(leaf_size, 8) * possible_cpus`. The CPU count is
//! re-read on every call.
//!
//! ## Iteration
//!
//! [`TableIterator`] walks a map with the kernel's first-key/next-key
//! protocol. There is no snapshot isolation: entries inserted or deleted
//! during a walk may be skipped or seen twice.

use std::io;

use crate::domain::{MapId, TableError};

pub mod cpus;
pub mod iter;
pub mod kernel;
pub mod layout;
pub mod map_table;
pub mod memory;
pub mod stack;

pub use iter::TableIterator;
pub use kernel::KernelMap;
pub use layout::{FieldFormatter, Layout, LayoutError, LayoutSpec, RawHex};
pub use map_table::{MapTable, TableConfig};
pub use memory::MemoryMap;
pub use stack::StackExtractor;

/// Kind of a kernel map, as far as buffer sizing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Hash, array, LRU, stack-trace and LPM maps: one leaf per key
    Generic,
    /// `BPF_MAP_TYPE_PERCPU_HASH` and its LRU variant
    PerCpuHash,
    /// `BPF_MAP_TYPE_PERCPU_ARRAY`
    PerCpuArray,
    /// Any other map type, carried as the raw kernel type number
    Other(u32),
}

impl MapKind {
    /// Classify a raw `bpf_map_type` value
    #[must_use]
    pub fn from_raw(map_type: u32) -> Self {
        use tracemap_common::{
            BPF_MAP_TYPE_ARRAY, BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_LPM_TRIE, BPF_MAP_TYPE_LRU_HASH,
            BPF_MAP_TYPE_LRU_PERCPU_HASH, BPF_MAP_TYPE_PERCPU_ARRAY, BPF_MAP_TYPE_PERCPU_HASH,
            BPF_MAP_TYPE_STACK_TRACE,
        };
        match map_type {
            BPF_MAP_TYPE_PERCPU_HASH | BPF_MAP_TYPE_LRU_PERCPU_HASH => Self::PerCpuHash,
            BPF_MAP_TYPE_PERCPU_ARRAY => Self::PerCpuArray,
            BPF_MAP_TYPE_HASH
            | BPF_MAP_TYPE_ARRAY
            | BPF_MAP_TYPE_STACK_TRACE
            | BPF_MAP_TYPE_LRU_HASH
            | BPF_MAP_TYPE_LPM_TRIE => Self::Generic,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn is_per_cpu(self) -> bool {
        matches!(self, Self::PerCpuHash | Self::PerCpuArray)
    }
}

/// Static properties of a kernel map
///
/// Fixed when the loader creates the map. Backends return a fresh copy on
/// every [`MapBackend::descriptor`] call; the table never caches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDescriptor {
    pub id: MapId,
    pub name: String,
    pub key_size: usize,
    pub leaf_size: usize,
    pub kind: MapKind,
    pub capacity: u32,
}

impl MapDescriptor {
    /// Size of the buffer a lookup fills, given the number of possible CPUs
    #[must_use]
    pub fn value_size(&self, possible_cpus: usize) -> usize {
        if self.kind.is_per_cpu() {
            self.leaf_size.next_multiple_of(8) * possible_cpus
        } else {
            self.leaf_size
        }
    }
}

/// Capability interface over one kernel map
///
/// Mirrors the raw element commands of `bpf(2)`. Errors carry the kernel
/// errno; `ENOENT` maps to [`io::ErrorKind::NotFound`]. Implementations are
/// not required to be internally synchronized.
pub trait MapBackend {
    /// Query the map's static properties
    fn descriptor(&self) -> Result<MapDescriptor, TableError>;

    /// Number of possible CPUs, used to size per-CPU leaves
    fn possible_cpus(&self) -> Result<usize, TableError>;

    /// Copy the leaf stored under `key` into `leaf`
    fn lookup(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()>;

    /// Store `leaf` under `key` with the given `BPF_*` update flags
    fn update(&self, key: &[u8], leaf: &[u8], flags: u64) -> io::Result<()>;

    /// Remove `key` from the map
    fn delete(&self, key: &[u8]) -> io::Result<()>;

    /// Write the first key of the map into `key`
    fn first_key(&self, key: &mut [u8]) -> io::Result<()>;

    /// Replace `key` with the key that follows it
    ///
    /// When `key` is no longer in a hash map the kernel restarts from the
    /// first key.
    fn next_key(&self, key: &mut [u8]) -> io::Result<()>;
}

fn size_mismatch(what: &str, expected: usize, actual: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} is {actual} bytes, table expects {expected}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: MapKind, leaf_size: usize) -> MapDescriptor {
        MapDescriptor {
            id: MapId(1),
            name: "counts".to_string(),
            key_size: 4,
            leaf_size,
            kind,
            capacity: 16,
        }
    }

    #[test]
    fn test_map_kind_from_raw() {
        assert_eq!(MapKind::from_raw(1), MapKind::Generic);
        assert_eq!(MapKind::from_raw(5), MapKind::PerCpuHash);
        assert_eq!(MapKind::from_raw(10), MapKind::PerCpuHash);
        assert_eq!(MapKind::from_raw(6), MapKind::PerCpuArray);
        assert_eq!(MapKind::from_raw(tracemap_common::BPF_MAP_TYPE_LPM_TRIE), MapKind::Generic);
        assert_eq!(MapKind::from_raw(27), MapKind::Other(27));
    }

    #[test]
    fn test_value_size_generic_ignores_cpus() {
        assert_eq!(descriptor(MapKind::Generic, 12).value_size(8), 12);
    }

    #[test]
    fn test_value_size_per_cpu_multiplies() {
        assert_eq!(descriptor(MapKind::PerCpuHash, 8).value_size(4), 32);
        assert_eq!(descriptor(MapKind::PerCpuArray, 16).value_size(3), 48);
    }

    #[test]
    fn test_value_size_per_cpu_rounds_slots() {
        assert_eq!(descriptor(MapKind::PerCpuArray, 4).value_size(2), 16);
    }
}
