//! ELF function symbol tables
//!
//! Reads `.symtab` and `.dynsym` with the `object` crate and keeps the
//! `PT_LOAD` segments needed to translate file offsets into the virtual
//! addresses symbols are recorded at.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use object::{Object, ObjectSegment, ObjectSymbol, SymbolFlags};
use rustc_demangle::demangle;

use super::debuginfo;
use super::options::SymbolOptions;
use crate::domain::SymbolError;

/// One function symbol, name as stored in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

impl ElfSymbol {
    fn covers(&self, vaddr: u64, next: Option<&ElfSymbol>) -> bool {
        if vaddr < self.address {
            return false;
        }
        if self.size > 0 {
            return vaddr - self.address < self.size;
        }
        next.map_or(true, |n| vaddr < n.address)
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadSegment {
    vaddr: u64,
    mem_size: u64,
    file_offset: u64,
    file_size: u64,
}

/// Function symbols of one module, sorted by address
#[derive(Debug)]
pub struct ElfSymbols {
    path: PathBuf,
    symbols: Vec<ElfSymbol>,
    segments: Vec<LoadSegment>,
}

impl ElfSymbols {
    /// Parse a module's symbol tables
    ///
    /// With `use_debug_file`, a module lacking `.symtab` also takes the
    /// symbols of its separate debug file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid object
    pub fn load(path: &Path, options: &SymbolOptions) -> Result<Self, SymbolError> {
        let data = fs::read(path)?;
        let obj = object::File::parse(&*data)
            .map_err(|source| SymbolError::Object { path: path.to_path_buf(), source })?;

        let segments = obj
            .segments()
            .map(|seg| {
                let (file_offset, file_size) = seg.file_range();
                LoadSegment { vaddr: seg.address(), mem_size: seg.size(), file_offset, file_size }
            })
            .collect();

        let mut symbols = Vec::new();
        collect_symbols(&obj, options, &mut symbols);

        if obj.section_by_name(".symtab").is_none() && options.use_debug_file {
            if let Some(debug_path) =
                debuginfo::find_debug_file(path, &obj, options.check_debug_file_crc)
            {
                match Self::load_debug_symbols(&debug_path, options) {
                    Ok(extra) => symbols.extend(extra),
                    Err(e) => debug!("Skipping debug file {}: {e}", debug_path.display()),
                }
            }
        }

        symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup();
        debug!("Loaded {} function symbols from {}", symbols.len(), path.display());

        Ok(Self { path: path.to_path_buf(), symbols, segments })
    }

    fn load_debug_symbols(path: &Path, options: &SymbolOptions) -> Result<Vec<ElfSymbol>, SymbolError> {
        let data = fs::read(path)?;
        let obj = object::File::parse(&*data)
            .map_err(|source| SymbolError::Object { path: path.to_path_buf(), source })?;
        let mut symbols = Vec::new();
        collect_symbols(&obj, options, &mut symbols);
        Ok(symbols)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbols in address order
    pub fn iter(&self) -> impl Iterator<Item = &ElfSymbol> {
        self.symbols.iter()
    }

    /// Symbol covering a virtual address, with the offset into it
    #[must_use]
    pub fn lookup(&self, vaddr: u64) -> Option<(&ElfSymbol, u64)> {
        let idx = self.symbols.partition_point(|s| s.address <= vaddr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        sym.covers(vaddr, self.symbols.get(idx)).then(|| (sym, vaddr - sym.address))
    }

    /// Symbol by stored or demangled name
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&ElfSymbol> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .or_else(|| self.symbols.iter().find(|s| demangle_symbol(&s.name) == name))
    }

    /// Virtual address of a file offset, via the `PT_LOAD` segments
    #[must_use]
    pub fn file_offset_to_vaddr(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| offset >= s.file_offset && offset - s.file_offset < s.file_size)
            .map(|s| offset - s.file_offset + s.vaddr)
    }

    /// File offset of a virtual address, via the `PT_LOAD` segments
    #[must_use]
    pub fn vaddr_to_file_offset(&self, vaddr: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| vaddr >= s.vaddr && vaddr - s.vaddr < s.mem_size)
            .map(|s| vaddr - s.vaddr + s.file_offset)
    }
}

fn collect_symbols(obj: &object::File<'_>, options: &SymbolOptions, out: &mut Vec<ElfSymbol>) {
    for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
        let SymbolFlags::Elf { st_info, .. } = symbol.flags() else {
            continue;
        };
        if !options.symbol_types.contains(st_info & 0xf) || symbol.is_undefined() {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if name.is_empty() || symbol.address() == 0 {
            continue;
        }
        out.push(ElfSymbol { name: name.to_string(), address: symbol.address(), size: symbol.size() });
    }
}

/// Demangle a Rust symbol name; other names pass through unchanged
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}
