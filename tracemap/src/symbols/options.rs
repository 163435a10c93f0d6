//! Resolver configuration

/// ELF symbol types to index, as a bit set over `STT_*` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTypes(pub u32);

impl SymbolTypes {
    pub const STT_FUNC: u8 = 2;
    pub const STT_GNU_IFUNC: u8 = 10;

    /// Plain functions and GNU indirect functions
    pub const FUNCTIONS: SymbolTypes =
        SymbolTypes((1 << Self::STT_FUNC) | (1 << Self::STT_GNU_IFUNC));

    #[must_use]
    pub fn contains(self, st_type: u8) -> bool {
        st_type < 32 && self.0 & (1 << st_type) != 0
    }
}

impl Default for SymbolTypes {
    fn default() -> Self {
        Self::FUNCTIONS
    }
}

/// How resolver handles load symbol information
///
/// The default favours attach latency: symbol tables are parsed lazily and
/// separate debug files are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolOptions {
    /// Look for a separate debug file when a module has no `.symtab`
    pub use_debug_file: bool,
    /// Verify the `.gnu_debuglink` CRC of a separate debug file
    pub check_debug_file_crc: bool,
    /// Parse a module's symbols on first lookup instead of at open time
    pub lazy_symbolize: bool,
    pub symbol_types: SymbolTypes,
}

impl Default for SymbolOptions {
    fn default() -> Self {
        Self {
            use_debug_file: false,
            check_debug_file_crc: false,
            lazy_symbolize: true,
            symbol_types: SymbolTypes::FUNCTIONS,
        }
    }
}

impl SymbolOptions {
    /// Defaults for caches attached to a stack-trace table
    #[must_use]
    pub fn for_table() -> Self {
        Self { use_debug_file: true, check_debug_file_crc: true, ..Self::default() }
    }

    #[must_use]
    pub fn with_debug_file(mut self, use_debug_file: bool) -> Self {
        self.use_debug_file = use_debug_file;
        self
    }

    #[must_use]
    pub fn with_debug_file_crc(mut self, check: bool) -> Self {
        self.check_debug_file_crc = check;
        self
    }

    #[must_use]
    pub fn with_lazy_symbolize(mut self, lazy: bool) -> Self {
        self.lazy_symbolize = lazy;
        self
    }

    #[must_use]
    pub fn with_symbol_types(mut self, types: SymbolTypes) -> Self {
        self.symbol_types = types;
        self
    }
}
