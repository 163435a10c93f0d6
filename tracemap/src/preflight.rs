//! Pre-flight checks for tracemap
//!
//! Run before opening kernel maps or reading another process's memory, so
//! a missing privilege shows up as one readable message instead of an
//! `EPERM` from deep inside a syscall.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::warn;
use std::fs;

/// Map ids and NULL first-key lookups both arrived in 4.12
const MIN_KERNEL_VERSION: (u32, u32) = (4, 12);

/// Run the checks needed before opening kernel maps
///
/// # Errors
/// Returns an error describing the first unmet requirement
pub fn run_preflight_checks() -> Result<()> {
    require_root()?;
    require_map_ids()?;
    Ok(())
}

fn require_root() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!(
            "Permission denied: opening BPF maps by id needs root.\n\n\
             Run with: sudo tracemap ..."
        );
    }
    Ok(())
}

/// `(major, minor)` of a release string such as `6.1.0-arch1-1`
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let (major, rest) = release.trim().split_once('.')?;
    let minor: String = rest.chars().take_while(char::is_ascii_digit).collect();
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn require_map_ids() -> Result<()> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to read /proc/sys/kernel/osrelease")?;
    let Some(version) = parse_release(&release) else {
        warn!("Unrecognized kernel release {:?}, skipping version check", release.trim());
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        let (major, minor) = MIN_KERNEL_VERSION;
        bail!(
            "Kernel {} cannot look maps up by id.\n\n\
             tracemap needs Linux {major}.{minor} or newer.",
            release.trim()
        );
    }
    Ok(())
}

/// Check that addresses in `pid` can be symbolized
///
/// Negative pids stand for the kernel: kallsyms must be readable, and a
/// table of zero addresses (`kptr_restrict`) only earns a warning since
/// resolution then falls back to raw addresses.
///
/// # Errors
/// Returns an error if the process is gone or its maps are unreadable
pub fn check_proc_access(pid: i32) -> Result<()> {
    if pid < 0 {
        let kallsyms = fs::read_to_string("/proc/kallsyms").context("Cannot read /proc/kallsyms")?;
        if kallsyms.lines().filter_map(|l| l.split_whitespace().next()).all(|a| a.trim_start_matches('0').is_empty()) {
            warn!("/proc/kallsyms hides addresses (kptr_restrict); kernel frames will stay unresolved");
        }
        return Ok(());
    }

    let maps_path = format!("/proc/{pid}/maps");
    match fs::read_to_string(&maps_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("Process {pid} not found.\n\nIt may have exited; check with: ps -p {pid}")
        }
        Err(e) => Err(e).with_context(|| {
            format!(
                "Cannot read {maps_path}\n\n\
                 Reading another user's process needs sudo or CAP_SYS_PTRACE."
            )
        }),
    }
}
