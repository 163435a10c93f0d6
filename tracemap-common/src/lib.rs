//! # Shared Data Structures (BPF ↔ Userspace)
//!
//! Defines the byte layouts and constants that instrumentation programs and
//! userspace agree on. All types use `#[repr(C)]` so the kernel's view of a map
//! slot and ours are identical.
//!
//! ## Key Types
//!
//! - [`StackTrace`] - Leaf of a `BPF_MAP_TYPE_STACK_TRACE` map
//! - [`StackKey`] - Sample key pairing a process with its user/kernel stack ids

#![no_std]

// ============================================================================
// Kernel ABI Constants
// ============================================================================

/// Maximum number of instruction pointers in one stack trace leaf
///
/// Mirrors `PERF_MAX_STACK_DEPTH` as used by `bpf_get_stackid()`. Longer stacks
/// are truncated by the kernel before they reach the map.
pub const MAX_STACK_DEPTH: usize = 127;

/// `BPF_MAP_TYPE_HASH`
pub const BPF_MAP_TYPE_HASH: u32 = 1;

/// `BPF_MAP_TYPE_ARRAY`
pub const BPF_MAP_TYPE_ARRAY: u32 = 2;

/// `BPF_MAP_TYPE_PERCPU_HASH` - one leaf per possible CPU
pub const BPF_MAP_TYPE_PERCPU_HASH: u32 = 5;

/// `BPF_MAP_TYPE_PERCPU_ARRAY` - one leaf per possible CPU
pub const BPF_MAP_TYPE_PERCPU_ARRAY: u32 = 6;

/// `BPF_MAP_TYPE_STACK_TRACE`
pub const BPF_MAP_TYPE_STACK_TRACE: u32 = 7;

/// `BPF_MAP_TYPE_LRU_HASH`
pub const BPF_MAP_TYPE_LRU_HASH: u32 = 9;

/// `BPF_MAP_TYPE_LRU_PERCPU_HASH` - one leaf per possible CPU
pub const BPF_MAP_TYPE_LRU_PERCPU_HASH: u32 = 10;

/// `BPF_MAP_TYPE_LPM_TRIE`
pub const BPF_MAP_TYPE_LPM_TRIE: u32 = 11;

/// `BPF_ANY`: create a new element or update an existing one
pub const BPF_ANY: u64 = 0;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// One captured call stack, as stored by `bpf_get_stackid()`
///
/// Entries after the deepest frame are zero. A zero entry terminates the
/// stack even if non-zero garbage follows it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackTrace {
    pub ip: [u64; MAX_STACK_DEPTH],
}

impl StackTrace {
    /// Size of the leaf in bytes (`127 * 8`)
    pub const SIZE: usize = MAX_STACK_DEPTH * core::mem::size_of::<u64>();

    /// Number of frames before the first zero address
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ip.iter().position(|&ip| ip == 0).unwrap_or(MAX_STACK_DEPTH)
    }

    /// The populated prefix of the stack
    #[must_use]
    pub fn frames(&self) -> &[u64] {
        &self.ip[..self.depth()]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self { ip: [0; MAX_STACK_DEPTH] }
    }
}

/// Key emitted by sampling programs: which process, and where its stacks are
///
/// Stack ids are signed: a negative value is the errno `bpf_get_stackid()`
/// returned when the stack could not be captured.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StackKey {
    pub pid: u32,
    pub user_stack_id: i32,
    pub kernel_stack_id: i32,
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya and the table layer treat these as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for StackTrace {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for StackKey {}
