use std::sync::Arc;

use tracemap::domain::{MapId, Pid, StackId, SymbolError};
use tracemap::symbols::{
    Resolution, SymbolBackend, SymbolCache, SymbolLocation, SymbolOptions, SymbolResolver,
};
use tracemap::table::stack::UNKNOWN_SYMBOL;
use tracemap::table::{MapDescriptor, MapKind, MapTable, MemoryMap, StackExtractor};
use tracemap_common::{StackTrace, MAX_STACK_DEPTH};

fn stack_table() -> MapTable<MemoryMap> {
    MapTable::new(MemoryMap::new(MapDescriptor {
        id: MapId(5),
        name: "stack_traces".to_string(),
        key_size: 4,
        leaf_size: StackTrace::SIZE,
        kind: MapKind::Generic,
        capacity: 16,
    }))
}

fn store(table: &MapTable<MemoryMap>, id: u32, ips: &[u64]) {
    let mut trace = StackTrace::default();
    trace.ip[..ips.len()].copy_from_slice(ips);
    table.set_value(&id, &trace).unwrap();
}

/// Names addresses below 0x1000 after themselves, places 0x1000..0x2000 in
/// a module, and knows nothing else
struct Named;

impl SymbolResolver for Named {
    fn resolve(&mut self, addr: u64) -> Resolution {
        match addr {
            0..=0xfff => Resolution::Symbol { name: format!("fn_{addr:x}"), module: "app".to_string(), offset: 0 },
            0x1000..=0x1fff => Resolution::Module { module: "app".to_string(), offset: addr - 0x1000 },
            _ => Resolution::Unknown,
        }
    }

    fn resolve_name(&mut self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        Err(SymbolError::NotFound { module: module.to_string(), name: name.to_string() })
    }
}

struct NamedBackend;

impl SymbolBackend for NamedBackend {
    fn open(&self, _: Pid, _: &SymbolOptions) -> Result<Box<dyn SymbolResolver>, SymbolError> {
        Ok(Box::new(Named))
    }

    fn for_each_function_symbol(&self, _: &str, _: &mut dyn FnMut(&str, u64)) -> Result<(), SymbolError> {
        Ok(())
    }

    fn locate_in_module(&self, module: &str, _: &str) -> Result<SymbolLocation, SymbolError> {
        Err(SymbolError::ModuleNotFound(module.to_string()))
    }
}

fn extractor(table: MapTable<MemoryMap>) -> StackExtractor<MemoryMap> {
    StackExtractor::with_symbols(table, SymbolCache::new(Arc::new(NamedBackend), SymbolOptions::for_table()))
}

#[test]
fn test_missing_stack_id_touches_nothing() {
    let stacks = extractor(stack_table());
    assert!(stacks.resolve_stack(StackId(0), true).is_empty());
    assert!(stacks.resolve_stack(StackId(-14), true).is_empty());
    stacks.clear_stack_id(StackId(0));

    let backend = stacks.table().backend();
    assert_eq!(backend.lookup_calls(), 0);
    assert_eq!(backend.delete_calls(), 0);
}

#[test]
fn test_stack_stops_at_first_zero() {
    let table = stack_table();
    store(&table, 3, &[0xAA, 0xBB]);
    let stacks = extractor(table);
    assert_eq!(stacks.resolve_stack(StackId(3), false), vec![0xAA, 0xBB]);
    // Still there without clear
    assert_eq!(stacks.table().backend().len(), 1);
}

#[test]
fn test_full_depth_stack() {
    let table = stack_table();
    let ips: Vec<u64> = (1..=MAX_STACK_DEPTH as u64).collect();
    store(&table, 1, &ips);
    assert_eq!(extractor(table).resolve_stack(StackId(1), false), ips);
}

#[test]
fn test_clear_releases_stack_id() {
    let table = stack_table();
    store(&table, 3, &[0xAA]);
    let stacks = extractor(table);
    assert_eq!(stacks.resolve_stack(StackId(3), true), vec![0xAA]);
    assert!(stacks.table().backend().is_empty());
}

#[test]
fn test_clear_is_attempted_when_read_fails() {
    let stacks = extractor(stack_table());
    assert!(stacks.try_resolve_stack(StackId(9), true).unwrap_err().is_not_found());
    assert!(stacks.resolve_stack(StackId(9), true).is_empty());
    assert_eq!(stacks.table().backend().delete_calls(), 2);
}

#[test]
fn test_clear_stack_id() {
    let table = stack_table();
    store(&table, 4, &[0x1]);
    let stacks = extractor(table);
    stacks.clear_stack_id(StackId(4));
    assert!(stacks.table().backend().is_empty());
    // Releasing again only logs
    stacks.clear_stack_id(StackId(4));
}

#[test]
fn test_symbolize_stack_uses_fallbacks() {
    let table = stack_table();
    store(&table, 2, &[0x10, 0x1010, 0x9000]);
    let mut stacks = extractor(table);
    assert_eq!(
        stacks.symbolize_stack(StackId(2), Pid(100), true),
        vec!["fn_10".to_string(), "[m] app + 0x00000010".to_string(), "0x0000000000009000".to_string()]
    );
}

#[test]
fn test_symbol_for_has_no_module_fallback() {
    let mut stacks = extractor(stack_table());
    assert_eq!(stacks.symbol_for(Pid(100), 0x20), "fn_20");
    assert_eq!(stacks.symbol_for(Pid(100), 0x1020), UNKNOWN_SYMBOL);
    assert_eq!(stacks.symbol_for(Pid::KERNEL, 0x9000), UNKNOWN_SYMBOL);
    assert_eq!(stacks.symbols_mut().len(), 2);
}

#[test]
fn test_mismatched_key_size_never_reaches_the_map() {
    let table = MapTable::new(MemoryMap::new(MapDescriptor {
        id: MapId(6),
        name: "wide_stacks".to_string(),
        key_size: 8,
        leaf_size: StackTrace::SIZE,
        kind: MapKind::Generic,
        capacity: 4,
    }));
    let stacks = extractor(table);
    assert!(stacks.resolve_stack(StackId(3), true).is_empty());
    stacks.clear_stack_id(StackId(3));

    let backend = stacks.table().backend();
    assert_eq!(backend.lookup_calls(), 0);
    assert_eq!(backend.delete_calls(), 0);
}
