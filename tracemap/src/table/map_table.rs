//! Raw-byte access to a single kernel map

#![allow(unsafe_code)] // Pod <-> byte slice conversion

use std::io;
use std::mem;
use std::sync::Arc;

use aya::Pod;
use log::debug;

use super::iter::TableIterator;
use super::layout::{FieldFormatter, RawHex};
use super::{size_mismatch, MapBackend, MapDescriptor, MapKind};
use crate::domain::{MapId, TableError};

/// Table properties, as reported by [`MapTable::config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub name: String,
    pub id: MapId,
    pub key_size: usize,
    pub leaf_size: usize,
    pub kind: MapKind,
    pub capacity: u32,
    pub key_desc: Option<String>,
    pub leaf_desc: Option<String>,
}

/// Handle to one kernel map, moving raw key and leaf bytes in and out
///
/// Not internally synchronized. Independent handles to the same map id may
/// be used from different threads; the kernel serializes single-element
/// operations.
pub struct MapTable<B: MapBackend> {
    backend: B,
    key_format: Arc<dyn FieldFormatter>,
    leaf_format: Arc<dyn FieldFormatter>,
}

impl<B: MapBackend> MapTable<B> {
    /// Wrap a backend, rendering keys and leaves as raw hex
    pub fn new(backend: B) -> Self {
        Self { backend, key_format: Arc::new(RawHex), leaf_format: Arc::new(RawHex) }
    }

    /// Use the given formatters for key and leaf text
    #[must_use]
    pub fn with_formatters(
        mut self,
        key: Arc<dyn FieldFormatter>,
        leaf: Arc<dyn FieldFormatter>,
    ) -> Self {
        self.key_format = key;
        self.leaf_format = leaf;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Query the map's descriptor from the backend
    ///
    /// # Errors
    /// Returns an error if the backend cannot describe the map
    pub fn descriptor(&self) -> Result<MapDescriptor, TableError> {
        self.backend.descriptor()
    }

    /// Table properties including the layout descriptors, when known
    ///
    /// # Errors
    /// Returns an error if the backend cannot describe the map
    pub fn config(&self) -> Result<TableConfig, TableError> {
        let d = self.descriptor()?;
        Ok(TableConfig {
            name: d.name,
            id: d.id,
            key_size: d.key_size,
            leaf_size: d.leaf_size,
            kind: d.kind,
            capacity: d.capacity,
            key_desc: self.key_format.descriptor().map(str::to_string),
            leaf_desc: self.leaf_format.descriptor().map(str::to_string),
        })
    }

    /// Size of a full leaf buffer: the descriptor's leaf size, scaled by the
    /// possible CPU count for per-CPU maps
    ///
    /// # Errors
    /// Returns an error if the descriptor or CPU count cannot be read
    pub fn leaf_size(&self) -> Result<usize, TableError> {
        let descriptor = self.descriptor()?;
        self.value_size(&descriptor)
    }

    pub(crate) fn value_size(&self, descriptor: &MapDescriptor) -> Result<usize, TableError> {
        let cpus = if descriptor.kind.is_per_cpu() { self.backend.possible_cpus()? } else { 1 };
        Ok(descriptor.value_size(cpus))
    }

    /// Look up the leaf stored under `key`
    ///
    /// # Errors
    /// Returns [`TableError::Lookup`] if the key is absent or has the wrong size
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, TableError> {
        let descriptor = self.descriptor()?;
        if key.len() != descriptor.key_size {
            return Err(TableError::Lookup {
                key: self.render_key(key),
                source: size_mismatch("key", descriptor.key_size, key.len()),
            });
        }

        let mut leaf = vec![0u8; self.value_size(&descriptor)?];
        self.backend
            .lookup(key, &mut leaf)
            .map_err(|source| TableError::Lookup { key: self.render_key(key), source })?;
        Ok(leaf)
    }

    /// Store `leaf` under `key`, creating or replacing the entry
    ///
    /// # Errors
    /// Returns [`TableError::Update`] if the kernel rejects the write
    pub fn set(&self, key: &[u8], leaf: &[u8]) -> Result<(), TableError> {
        let descriptor = self.descriptor()?;
        let expected_leaf = self.value_size(&descriptor)?;
        let check = if key.len() == descriptor.key_size {
            if leaf.len() == expected_leaf {
                Ok(())
            } else {
                Err(size_mismatch("leaf", expected_leaf, leaf.len()))
            }
        } else {
            Err(size_mismatch("key", descriptor.key_size, key.len()))
        };

        check
            .and_then(|()| self.backend.update(key, leaf, tracemap_common::BPF_ANY))
            .map_err(|source| TableError::Update {
                key: self.render_key(key),
                leaf: self.render_leaf(leaf),
                source,
            })
    }

    /// Remove `key` from the map
    ///
    /// # Errors
    /// Returns [`TableError::Delete`] if the key does not exist
    pub fn delete(&self, key: &[u8]) -> Result<(), TableError> {
        let descriptor = self.descriptor()?;
        let result = if key.len() == descriptor.key_size {
            self.backend.delete(key)
        } else {
            Err(size_mismatch("key", descriptor.key_size, key.len()))
        };
        result.map_err(|source| TableError::Delete { key: self.render_key(key), source })
    }

    /// Delete every entry, walking the map with first-key/next-key
    ///
    /// Best effort under concurrent writers: entries inserted behind the
    /// cursor may survive.
    ///
    /// # Errors
    /// Returns [`TableError::DeleteAll`] if a delete or key walk fails
    pub fn delete_all(&self) -> Result<(), TableError> {
        let descriptor = self.descriptor()?;
        let mut key = vec![0u8; descriptor.key_size];
        let mut deleted = 0usize;

        let mut step = self.backend.first_key(&mut key);
        while step.is_ok() {
            self.backend.delete(&key).map_err(|source| TableError::DeleteAll { source })?;
            deleted += 1;
            step = self.backend.next_key(&mut key);
        }

        debug!("Cleared {deleted} entries from {}", descriptor.id);
        match step {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(TableError::DeleteAll { source: e })
            }
            _ => Ok(()),
        }
    }

    /// Start a walk over all entries
    pub fn iter(&self) -> TableIterator<'_, B> {
        TableIterator::new(self)
    }

    /// Copy every entry out of the map
    ///
    /// # Errors
    /// Returns the error that ended the walk, if it was not exhaustion
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
        let mut iter = self.iter();
        let mut entries = Vec::new();
        while iter.advance() {
            if let (Some(key), Some(leaf)) = (iter.key(), iter.leaf()) {
                entries.push((key.to_vec(), leaf.to_vec()));
            }
        }
        match iter.take_err() {
            Some(e) => Err(e),
            None => Ok(entries),
        }
    }

    /// Render a key with the table's key formatter
    ///
    /// # Errors
    /// Returns [`TableError::Format`] if the bytes do not fit the key layout
    pub fn key_to_string(&self, key: &[u8]) -> Result<String, TableError> {
        format_with(&*self.key_format, "table-key", key)
    }

    /// Render a leaf with the table's leaf formatter
    ///
    /// A full per-CPU leaf renders as `[ cpu0 cpu1 ... ]`.
    ///
    /// # Errors
    /// Returns [`TableError::Format`] if the bytes do not fit the leaf layout
    pub fn leaf_to_string(&self, leaf: &[u8]) -> Result<String, TableError> {
        let descriptor = self.descriptor()?;
        let slot = descriptor.leaf_size.next_multiple_of(8);
        if !descriptor.kind.is_per_cpu() || leaf.len() == descriptor.leaf_size || slot == 0 {
            return format_with(&*self.leaf_format, "table-leaf", leaf);
        }

        if leaf.len() % slot != 0 {
            return Err(TableError::Format {
                what: "table-leaf",
                reason: format!("{} bytes is not a whole number of {slot}-byte CPU slots", leaf.len()),
            });
        }
        let values = leaf
            .chunks_exact(slot)
            .map(|chunk| format_with(&*self.leaf_format, "table-leaf", &chunk[..descriptor.leaf_size]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("[ {} ]", values.join(" ")))
    }

    /// Scan a key from text
    ///
    /// # Errors
    /// Returns [`TableError::Parse`], carrying the input, on failure
    pub fn string_to_key(&self, text: &str) -> Result<Vec<u8>, TableError> {
        let size = self.descriptor()?.key_size;
        parse_with(&*self.key_format, "key", text, size)
    }

    /// Scan a single (not per-CPU) leaf from text
    ///
    /// # Errors
    /// Returns [`TableError::Parse`], carrying the input, on failure
    pub fn string_to_leaf(&self, text: &str) -> Result<Vec<u8>, TableError> {
        let size = self.descriptor()?.leaf_size;
        parse_with(&*self.leaf_format, "leaf", text, size)
    }

    /// Typed lookup for plain-old-data keys and leaves
    ///
    /// # Errors
    /// Returns [`TableError::Lookup`] if the key is absent, or a size error if
    /// `V` does not match the leaf
    pub fn get_value<K: Pod, V: Pod>(&self, key: &K) -> Result<V, TableError> {
        let leaf = self.get(bytes_of(key))?;
        from_bytes(&leaf).ok_or_else(|| TableError::Lookup {
            key: self.render_key(bytes_of(key)),
            source: size_mismatch("leaf", leaf.len(), mem::size_of::<V>()),
        })
    }

    /// Typed create-or-update for plain-old-data keys and leaves
    ///
    /// # Errors
    /// Returns [`TableError::Update`] if the kernel rejects the write
    pub fn set_value<K: Pod, V: Pod>(&self, key: &K, value: &V) -> Result<(), TableError> {
        self.set(bytes_of(key), bytes_of(value))
    }

    /// Lookup into a caller buffer, without error rendering
    ///
    /// `leaf` must be exactly [`leaf_size`](Self::leaf_size) bytes.
    ///
    /// # Errors
    /// Returns `InvalidInput` for wrongly sized buffers, otherwise the
    /// kernel errno
    pub fn lookup_into(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()> {
        self.check_buffers(key, Some(leaf.len()))?;
        self.backend.lookup(key, leaf)
    }

    /// Create-or-update, without error rendering
    ///
    /// # Errors
    /// Returns `InvalidInput` for wrongly sized buffers, otherwise the
    /// kernel errno
    pub fn update_from(&self, key: &[u8], leaf: &[u8]) -> io::Result<()> {
        self.check_buffers(key, Some(leaf.len()))?;
        self.backend.update(key, leaf, tracemap_common::BPF_ANY)
    }

    /// Delete, without error rendering
    ///
    /// # Errors
    /// Returns `InvalidInput` for a wrongly sized key, otherwise the kernel
    /// errno
    pub fn remove(&self, key: &[u8]) -> io::Result<()> {
        self.check_buffers(key, None)?;
        self.backend.delete(key)
    }

    fn check_buffers(&self, key: &[u8], leaf_len: Option<usize>) -> io::Result<()> {
        let descriptor = self.descriptor().map_err(io::Error::other)?;
        if key.len() != descriptor.key_size {
            return Err(size_mismatch("key", descriptor.key_size, key.len()));
        }
        if let Some(len) = leaf_len {
            let expected = self.value_size(&descriptor).map_err(io::Error::other)?;
            if len != expected {
                return Err(size_mismatch("leaf", expected, len));
            }
        }
        Ok(())
    }

    pub(crate) fn render_key(&self, key: &[u8]) -> String {
        self.key_format.format(key).unwrap_or_else(|_| format!("{key:?}"))
    }

    fn render_leaf(&self, leaf: &[u8]) -> String {
        self.leaf_to_string(leaf).unwrap_or_else(|_| format!("{leaf:?}"))
    }
}

fn format_with(
    formatter: &dyn FieldFormatter,
    what: &'static str,
    bytes: &[u8],
) -> Result<String, TableError> {
    let text = formatter
        .format(bytes)
        .map_err(|e| TableError::Format { what, reason: e.to_string() })?;
    // Formatter output ends at the first NUL, like a C string buffer
    Ok(match text.split_once('\0') {
        Some((head, _)) => head.to_string(),
        None => text,
    })
}

fn parse_with(
    formatter: &dyn FieldFormatter,
    what: &'static str,
    text: &str,
    size: usize,
) -> Result<Vec<u8>, TableError> {
    let parse_error = |reason: String| TableError::Parse { what, input: text.to_string(), reason };
    let bytes = formatter.parse(text).map_err(|e| parse_error(e.to_string()))?;
    if bytes.len() != size {
        return Err(parse_error(format!("scanned {} bytes, table expects {size}", bytes.len())));
    }
    Ok(bytes)
}

fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: Pod types have no padding invariants and may be viewed as bytes
    unsafe { std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), mem::size_of::<T>()) }
}

fn from_bytes<T: Pod>(bytes: &[u8]) -> Option<T> {
    if bytes.len() != mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; Pod types accept any bit pattern
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}
