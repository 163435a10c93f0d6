//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process ids, kernel map ids and stack ids
//! from being mixed up at call sites that all take small integers.

use std::fmt;

/// Process ID
///
/// `Pid::KERNEL` (-1) means "no process context": symbols are resolved against
/// the running kernel instead of a process's memory maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    /// Kernel-space pseudo process
    pub const KERNEL: Pid = Pid(-1);

    /// Any negative pid collapses to [`Pid::KERNEL`]
    #[must_use]
    pub fn normalized(self) -> Self {
        if self.0 < 0 {
            Self::KERNEL
        } else {
            self
        }
    }

    #[must_use]
    pub fn is_kernel(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_kernel() {
            write!(f, "PID:kernel")
        } else {
            write!(f, "PID:{}", self.0)
        }
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// Kernel map ID
///
/// Global, kernel-assigned identifier of a loaded BPF map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// Stack trace ID from a stack-trace map
///
/// Zero and negative values mean no stack was captured (negative values are
/// the errno `bpf_get_stackid()` returned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub i64);

impl StackId {
    /// Returns true if this id refers to a stored stack
    #[must_use]
    pub fn is_captured(self) -> bool {
        self.0 > 0
    }

    /// Native-endian map key for the stack-trace map
    ///
    /// Only meaningful when [`StackId::is_captured`] holds; the kernel uses
    /// 32-bit keys for stack maps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_map_key(self) -> [u8; 4] {
        (self.0 as u32).to_ne_bytes()
    }
}

impl From<i32> for StackId {
    fn from(id: i32) -> Self {
        StackId(i64::from(id))
    }
}
