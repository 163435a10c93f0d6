//! Separate debug file lookup
//!
//! Stripped binaries can ship their `.symtab` in a separate file, found
//! either by build id (`/usr/lib/debug/.build-id/ab/cdef....debug`) or by
//! the name stored in the `.gnu_debuglink` section.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::Crc;
use log::debug;
use object::Object;

const DEBUG_ROOT: &str = "/usr/lib/debug";

/// Path of the debug file for a build id, if the id is long enough to split
#[must_use]
pub fn build_id_path(build_id: &[u8]) -> Option<PathBuf> {
    let (first, rest) = build_id.split_first()?;
    if rest.is_empty() {
        return None;
    }
    let rest: String = rest.iter().map(|b| format!("{b:02x}")).collect();
    Some(PathBuf::from(format!("{DEBUG_ROOT}/.build-id/{first:02x}/{rest}.debug")))
}

/// Places a `.gnu_debuglink` name is looked up, in search order
#[must_use]
pub fn debuglink_candidates(module: &Path, link: &str) -> Vec<PathBuf> {
    let dir = module.parent().unwrap_or_else(|| Path::new("/"));
    let mut candidates = vec![dir.join(link), dir.join(".debug").join(link)];
    let relative = dir.strip_prefix("/").unwrap_or(dir);
    candidates.push(Path::new(DEBUG_ROOT).join(relative).join(link));
    candidates
}

/// CRC32 of a file's contents, as stored in `.gnu_debuglink`
///
/// # Errors
/// Returns an error if the file cannot be read
pub fn file_crc32(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut crc = Crc::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    Ok(crc.sum())
}

/// Find the separate debug file for a parsed module
///
/// Build id wins over debuglink. With `check_crc`, a debuglink candidate is
/// only accepted when its CRC32 matches the one recorded in the module.
pub fn find_debug_file(module: &Path, obj: &object::File<'_>, check_crc: bool) -> Option<PathBuf> {
    if let Some(path) = obj.build_id().ok().flatten().and_then(build_id_path) {
        if path.is_file() && path != module {
            debug!("Debug file for {} via build id: {}", module.display(), path.display());
            return Some(path);
        }
    }

    let (link, expected_crc) = obj.gnu_debuglink().ok().flatten()?;
    let link = std::str::from_utf8(link).ok()?;
    debuglink_candidates(module, link).into_iter().find(|candidate| {
        if !candidate.is_file() || candidate == module {
            return false;
        }
        if !check_crc {
            return true;
        }
        match file_crc32(candidate) {
            Ok(crc) if crc == expected_crc => true,
            Ok(crc) => {
                debug!(
                    "Ignoring {}: crc {crc:08x} does not match {expected_crc:08x}",
                    candidate.display()
                );
                false
            }
            Err(e) => {
                debug!("Ignoring {}: {e}", candidate.display());
                false
            }
        }
    })
}
