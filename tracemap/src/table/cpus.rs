//! Possible CPU count for sizing per-CPU leaves
//!
//! Per-CPU map leaves hold one slot per *possible* CPU (not online), so the
//! count comes from /sys/devices/system/cpu/possible.

use std::fs;
use std::io;

const POSSIBLE_CPUS_PATH: &str = "/sys/devices/system/cpu/possible";

/// Get the list of possible CPU IDs
///
/// The format in /sys is like "0-3" or "0-3,8-11" for NUMA systems.
///
/// # Errors
/// Returns an error if the file cannot be read or is malformed
pub fn possible_cpus() -> io::Result<Vec<u32>> {
    let content = fs::read_to_string(POSSIBLE_CPUS_PATH)?;
    parse_cpu_list(&content)
}

/// Parse a kernel CPU list such as `0-3,8-11` or `5`
///
/// # Errors
/// Returns `InvalidData` for anything that is not a comma separated list of
/// numbers and ranges
pub fn parse_cpu_list(content: &str) -> io::Result<Vec<u32>> {
    let mut cpus = Vec::new();

    for range in content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            let start = parse_cpu(start)?;
            let end = parse_cpu(end)?;
            cpus.extend(start..=end);
        } else {
            cpus.push(parse_cpu(range)?);
        }
    }

    if cpus.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty CPU list"));
    }
    Ok(cpus)
}

fn parse_cpu(s: &str) -> io::Result<u32> {
    s.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad CPU id {s:?}: {e}")))
}
