//! In-process map backend
//!
//! [`MemoryMap`] follows kernel hash-map semantics closely enough to drive
//! [`MapTable`](super::MapTable) and [`TableIterator`](super::TableIterator)
//! without privileges: `ENOENT` for missing keys, `E2BIG` when full, and
//! `next_key` restarting from the first key when the given key has vanished.
//! Keys iterate in insertion order.
//!
//! Call counters let tests observe how many kernel-equivalent operations a
//! code path issued.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{MapBackend, MapDescriptor};
use crate::domain::TableError;

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

/// Map backend held entirely in memory
#[derive(Debug)]
pub struct MemoryMap {
    descriptor: MapDescriptor,
    possible_cpus: usize,
    entries: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    counters: Counters,
}

impl MemoryMap {
    /// Create an empty map with the given shape and a single CPU
    #[must_use]
    pub fn new(descriptor: MapDescriptor) -> Self {
        Self::with_cpus(descriptor, 1)
    }

    /// Create an empty map that reports `possible_cpus` CPUs
    #[must_use]
    pub fn with_cpus(descriptor: MapDescriptor, possible_cpus: usize) -> Self {
        Self {
            descriptor,
            possible_cpus,
            entries: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Number of entries currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn lookup_calls(&self) -> usize {
        self.counters.lookups.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn update_calls(&self) -> usize {
        self.counters.updates.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(Vec<u8>, Vec<u8>)>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_key(&self, key: &[u8]) -> io::Result<()> {
        if key.len() == self.descriptor.key_size {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    fn check_leaf(&self, leaf: &[u8]) -> io::Result<()> {
        if leaf.len() == self.descriptor.value_size(self.possible_cpus) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }
}

fn not_found() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

impl MapBackend for MemoryMap {
    fn descriptor(&self) -> Result<MapDescriptor, TableError> {
        Ok(self.descriptor.clone())
    }

    fn possible_cpus(&self) -> Result<usize, TableError> {
        Ok(self.possible_cpus)
    }

    fn lookup(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        self.check_key(key)?;
        self.check_leaf(leaf)?;
        let entries = self.entries();
        let (_, value) = entries.iter().find(|(k, _)| k == key).ok_or_else(not_found)?;
        leaf.copy_from_slice(value);
        Ok(())
    }

    fn update(&self, key: &[u8], leaf: &[u8], flags: u64) -> io::Result<()> {
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.check_key(key)?;
        self.check_leaf(leaf)?;
        if flags != tracemap_common::BPF_ANY {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut entries = self.entries();
        if let Some((_, value)) = entries.iter_mut().find(|(k, _)| k == key) {
            value.copy_from_slice(leaf);
            return Ok(());
        }
        if entries.len() >= self.descriptor.capacity as usize {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        entries.push((key.to_vec(), leaf.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_key(key)?;
        let mut entries = self.entries();
        let pos = entries.iter().position(|(k, _)| k == key).ok_or_else(not_found)?;
        entries.remove(pos);
        Ok(())
    }

    fn first_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.check_key(key)?;
        let entries = self.entries();
        let (first, _) = entries.first().ok_or_else(not_found)?;
        key.copy_from_slice(first);
        Ok(())
    }

    fn next_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.check_key(key)?;
        let entries = self.entries();
        let next = match entries.iter().position(|(k, _)| k == key) {
            Some(pos) => entries.get(pos + 1),
            None => entries.first(),
        };
        let (next, _) = next.ok_or_else(not_found)?;
        key.copy_from_slice(next);
        Ok(())
    }
}
