//! Process address space parsing
//!
//! Parses /proc/pid/maps into file-backed mappings so that instruction
//! pointers from position-independent executables and shared libraries can
//! be converted into file offsets.

use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::domain::{Pid, SymbolError};

/// Address range `[start, end)` in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One file-backed line of /proc/pid/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: MemoryRange,
    /// Offset into the file where the mapping starts
    pub offset: u64,
    pub perms: String,
    pub path: String,
}

impl Mapping {
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// File offset of a runtime address inside this mapping
    #[must_use]
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.range.start + self.offset
    }
}

/// Parse the text of a maps file, keeping only file-backed mappings
///
/// Anonymous regions and pseudo-paths such as `[stack]` or `[vdso]` are
/// skipped. A trailing ` (deleted)` marker is stripped from the path.
/// Malformed lines are skipped.
#[must_use]
pub fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Mapping> {
    // "start-end perms offset dev inode pathname"
    let mut rest = line;
    let range = next_field(&mut rest)?;
    let perms = next_field(&mut rest)?;
    let offset = next_field(&mut rest)?;
    let _dev = next_field(&mut rest)?;
    let _inode = next_field(&mut rest)?;
    // The path may itself contain spaces
    let path = rest.trim();

    if !path.starts_with('/') {
        return None;
    }
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        range: MemoryRange {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
        },
        offset: u64::from_str_radix(offset, 16).ok()?,
        perms: perms.to_string(),
        path: path.to_string(),
    })
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    let (field, tail) = s.split_at(end);
    *rest = tail;
    Some(field)
}

/// Read the file-backed mappings of a live process
///
/// # Errors
/// Returns [`SymbolError::ResolutionUnavailable`] if the maps file cannot be
/// read, usually because the process has exited
pub fn read_process_maps(pid: Pid) -> Result<Vec<Mapping>, SymbolError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let text = fs::read_to_string(&maps_path).map_err(|e| SymbolError::ResolutionUnavailable {
        pid,
        reason: format!("failed to read {maps_path}: {e}"),
    })?;

    let mappings = parse_maps(&text);
    debug!("{pid}: {} file-backed mappings", mappings.len());
    Ok(mappings)
}

/// Path to open for a module mapped by `pid`
///
/// Goes through `/proc/<pid>/root` when that view exists, so processes in
/// another mount namespace resolve to their own files.
#[must_use]
pub fn host_path(pid: Pid, path: &str) -> PathBuf {
    let rooted = PathBuf::from(format!("/proc/{}/root{path}", pid.0));
    if rooted.exists() {
        rooted
    } else {
        PathBuf::from(path)
    }
}

/// Mapping containing `addr`, if any
#[must_use]
pub fn find_mapping(mappings: &[Mapping], addr: u64) -> Option<&Mapping> {
    mappings.iter().find(|m| m.range.contains(addr))
}
