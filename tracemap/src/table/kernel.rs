//! Kernel map backend
//!
//! Opens a map by its global id through aya (which owns the fd and closes it
//! on drop) and issues the `BPF_MAP_*_ELEM` commands of `bpf(2)` directly on
//! byte buffers. aya's typed map wrappers need the key and value types at
//! compile time; this backend only knows sizes, and refuses any buffer whose
//! length differs from what the kernel will read or write.

#![allow(unsafe_code)] // bpf(2) has no safe wrapper for untyped buffers

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use aya::maps::{MapData, MapInfo};
use log::debug;

use super::{cpus, size_mismatch, MapBackend, MapDescriptor, MapKind};
use crate::domain::{MapId, TableError};

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;

/// `union bpf_attr` as used by the element commands
#[repr(C)]
#[derive(Default)]
struct ElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    /// `value` for lookup/update, `next_key` for get-next-key
    value: u64,
    flags: u64,
}

/// Bytes the kernel copies for one key and one full value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElemSizes {
    key: usize,
    value: usize,
}

impl ElemSizes {
    fn new(descriptor: &MapDescriptor, possible_cpus: usize) -> Self {
        Self { key: descriptor.key_size, value: descriptor.value_size(possible_cpus) }
    }

    fn check_key(self, key: &[u8]) -> io::Result<()> {
        if key.len() == self.key {
            Ok(())
        } else {
            Err(size_mismatch("key", self.key, key.len()))
        }
    }

    fn check_value(self, value: &[u8]) -> io::Result<()> {
        if value.len() == self.value {
            Ok(())
        } else {
            Err(size_mismatch("leaf", self.value, value.len()))
        }
    }
}

/// A kernel BPF map reached through an owned fd
pub struct KernelMap {
    id: MapId,
    data: MapData,
    sizes: ElemSizes,
}

impl KernelMap {
    /// Open the map with the given kernel id
    ///
    /// # Errors
    /// Returns an error if no such map exists or the caller lacks privileges
    pub fn from_id(id: MapId) -> Result<Self, TableError> {
        let data = MapData::from_id(id.0)
            .map_err(|e| TableError::Descriptor(format!("cannot open {id}: {e}")))?;
        let info = MapInfo::from_id(id.0).map_err(|e| TableError::Descriptor(e.to_string()))?;
        let descriptor = descriptor_from_info(&info)?;
        let cpus = if descriptor.kind.is_per_cpu() {
            cpus::possible_cpus().map_err(TableError::PossibleCpus)?.len()
        } else {
            1
        };
        let sizes = ElemSizes::new(&descriptor, cpus);
        debug!("Opened {id} ({} byte keys, {} byte values)", sizes.key, sizes.value);
        Ok(Self { id, data, sizes })
    }

    #[must_use]
    pub fn id(&self) -> MapId {
        self.id
    }

    fn raw_fd(&self) -> u32 {
        // fds are non-negative
        self.data.fd().as_fd().as_raw_fd().unsigned_abs()
    }

    /// Callers check every non-null buffer against `self.sizes` first
    fn command(&self, cmd: libc::c_long, key: *const u8, value: *const u8, flags: u64) -> io::Result<()> {
        let mut attr = ElemAttr {
            map_fd: self.raw_fd(),
            key: key as u64,
            value: value as u64,
            flags,
            ..ElemAttr::default()
        };
        // SAFETY: attr points to a live bpf_attr prefix; every buffer it
        // references is borrowed for the call and holds exactly the key or
        // value size the kernel copies for this map
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                std::ptr::addr_of_mut!(attr),
                std::mem::size_of::<ElemAttr>(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Convert aya's view of a map into a descriptor
///
/// # Errors
/// Returns an error if the kernel reports a map type aya cannot decode
pub fn descriptor_from_info(info: &MapInfo) -> Result<MapDescriptor, TableError> {
    let map_type = info.map_type().map_err(|e| TableError::Descriptor(e.to_string()))?;
    Ok(MapDescriptor {
        id: MapId(info.id()),
        name: info.name_as_str().unwrap_or_default().to_string(),
        key_size: info.key_size() as usize,
        leaf_size: info.value_size() as usize,
        kind: MapKind::from_raw(map_type as u32),
        capacity: info.max_entries(),
    })
}

impl MapBackend for KernelMap {
    fn descriptor(&self) -> Result<MapDescriptor, TableError> {
        let info =
            MapInfo::from_id(self.id.0).map_err(|e| TableError::Descriptor(e.to_string()))?;
        descriptor_from_info(&info)
    }

    fn possible_cpus(&self) -> Result<usize, TableError> {
        cpus::possible_cpus().map(|c| c.len()).map_err(TableError::PossibleCpus)
    }

    fn lookup(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()> {
        self.sizes.check_key(key)?;
        self.sizes.check_value(leaf)?;
        self.command(BPF_MAP_LOOKUP_ELEM, key.as_ptr(), leaf.as_mut_ptr(), 0)
    }

    fn update(&self, key: &[u8], leaf: &[u8], flags: u64) -> io::Result<()> {
        self.sizes.check_key(key)?;
        self.sizes.check_value(leaf)?;
        self.command(BPF_MAP_UPDATE_ELEM, key.as_ptr(), leaf.as_ptr(), flags)
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.sizes.check_key(key)?;
        self.command(BPF_MAP_DELETE_ELEM, key.as_ptr(), std::ptr::null(), 0)
    }

    fn first_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.sizes.check_key(key)?;
        // A NULL key asks for the first key (Linux 4.12+)
        self.command(BPF_MAP_GET_NEXT_KEY, std::ptr::null(), key.as_mut_ptr(), 0)
    }

    fn next_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.sizes.check_key(key)?;
        // The kernel copies the current key before writing the next one, so
        // in and out may share a buffer
        let ptr = key.as_mut_ptr();
        self.command(BPF_MAP_GET_NEXT_KEY, ptr, ptr, 0)
    }
}
