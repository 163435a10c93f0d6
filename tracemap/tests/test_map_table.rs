use std::collections::HashSet;
use std::io;

use tracemap::domain::{MapId, TableError};
use tracemap::table::{FieldFormatter, MapBackend, MapDescriptor, MapKind, MapTable, MemoryMap, RawHex};
use tracemap_common::StackKey;

fn descriptor(kind: MapKind, key_size: usize, leaf_size: usize) -> MapDescriptor {
    MapDescriptor { id: MapId(11), name: "counts".to_string(), key_size, leaf_size, kind, capacity: 64 }
}

fn counts() -> MapTable<MemoryMap> {
    MapTable::new(MemoryMap::new(descriptor(MapKind::Generic, 4, 8)))
}

#[test]
fn test_generic_round_trip() {
    let table = counts();
    let key = 7u32.to_ne_bytes();
    let leaf = 0xdead_beef_u64.to_ne_bytes();

    table.set(&key, &leaf).unwrap();
    assert_eq!(table.get(&key).unwrap(), leaf);

    // Create-or-replace
    let leaf = 1u64.to_ne_bytes();
    table.set(&key, &leaf).unwrap();
    assert_eq!(table.get(&key).unwrap(), leaf);
    assert_eq!(table.backend().len(), 1);
}

#[test]
fn test_per_cpu_round_trip() {
    let table = MapTable::new(MemoryMap::with_cpus(descriptor(MapKind::PerCpuHash, 4, 8), 4));
    assert_eq!(table.leaf_size().unwrap(), 32);

    let key = 1u32.to_ne_bytes();
    let leaf: Vec<u8> = (0..4u64).flat_map(u64::to_ne_bytes).collect();
    table.set(&key, &leaf).unwrap();
    assert_eq!(table.get(&key).unwrap(), leaf);
    let per_cpu: Vec<String> = (0..4u64).map(|v| RawHex.format(&v.to_ne_bytes()).unwrap()).collect();
    assert_eq!(table.leaf_to_string(&leaf).unwrap(), format!("[ {} ]", per_cpu.join(" ")));
}

#[test]
fn test_per_cpu_leaf_must_cover_every_cpu() {
    let table = MapTable::new(MemoryMap::with_cpus(descriptor(MapKind::PerCpuArray, 4, 4), 2));
    // 4-byte values occupy 8-byte slots
    assert_eq!(table.leaf_size().unwrap(), 16);
    let err = table.set(&0u32.to_ne_bytes(), &[0u8; 4]).unwrap_err();
    match err {
        TableError::Update { source, .. } => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_missing_key_is_not_found() {
    let table = counts();
    let err = table.get(&9u32.to_ne_bytes()).unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, TableError::Lookup { .. }));

    let err = table.delete(&9u32.to_ne_bytes()).unwrap_err();
    assert!(matches!(err, TableError::Delete { .. }));
    assert!(err.is_not_found());
}

#[test]
fn test_wrong_key_size_is_a_lookup_error() {
    let table = counts();
    let err = table.get(&[1, 2]).unwrap_err();
    match err {
        TableError::Lookup { source, .. } => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_delete_all_empties_table() {
    let table = counts();
    for k in 0..10u32 {
        table.set(&k.to_ne_bytes(), &u64::from(k).to_ne_bytes()).unwrap();
    }
    table.delete_all().unwrap();
    assert!(table.entries().unwrap().is_empty());
    assert_eq!(table.backend().delete_calls(), 10);

    // Clearing an empty table is fine
    table.delete_all().unwrap();
}

#[test]
fn test_iterates_every_key_once() {
    let table = counts();
    for k in [3u32, 1, 2] {
        table.set(&k.to_ne_bytes(), &[0u8; 8]).unwrap();
    }

    let mut seen = HashSet::new();
    let mut iter = table.iter();
    while iter.advance() {
        assert!(seen.insert(iter.key().unwrap().to_vec()));
        assert_eq!(iter.leaf().unwrap().len(), 8);
    }
    assert!(iter.err().is_none());
    assert_eq!(seen.len(), 3);
}

#[test]
fn test_empty_iteration() {
    let table = counts();
    let mut iter = table.iter();
    assert!(!iter.advance());
    assert!(iter.err().is_none());
}

/// Delegates to a [`MemoryMap`] but loses one key's leaf, as if another
/// process deleted it between get-next-key and lookup
struct Vanishing {
    inner: MemoryMap,
    lost: Vec<u8>,
}

impl MapBackend for Vanishing {
    fn descriptor(&self) -> Result<MapDescriptor, TableError> {
        self.inner.descriptor()
    }

    fn possible_cpus(&self) -> Result<usize, TableError> {
        self.inner.possible_cpus()
    }

    fn lookup(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()> {
        if key == self.lost.as_slice() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.inner.lookup(key, leaf)
    }

    fn update(&self, key: &[u8], leaf: &[u8], flags: u64) -> io::Result<()> {
        self.inner.update(key, leaf, flags)
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.inner.delete(key)
    }

    fn first_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.inner.first_key(key)
    }

    fn next_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.inner.next_key(key)
    }
}

#[test]
fn test_vanished_leaf_is_an_inconsistency() {
    let table = MapTable::new(Vanishing {
        inner: MemoryMap::new(descriptor(MapKind::Generic, 4, 8)),
        lost: 2u32.to_ne_bytes().to_vec(),
    });
    for k in [1u32, 2, 3] {
        table.set(&k.to_ne_bytes(), &[0u8; 8]).unwrap();
    }

    let mut iter = table.iter();
    assert!(iter.advance());
    assert!(!iter.advance());
    assert!(iter.key().is_none());
    assert!(matches!(iter.err(), Some(TableError::IterationInconsistency { .. })));
    // Failed is terminal
    assert!(!iter.advance());
}

#[test]
fn test_typed_values() {
    let table = MapTable::new(MemoryMap::new(descriptor(MapKind::Generic, 12, 8)));
    let key = StackKey { pid: 42, user_stack_id: 3, kernel_stack_id: -14 };
    table.set_value(&key, &99u64).unwrap();
    assert_eq!(table.get_value::<StackKey, u64>(&key).unwrap(), 99);
}

#[test]
fn test_string_codec_keeps_input_on_failure() {
    let table = counts();
    let text = table.key_to_string(&7u32.to_ne_bytes()).unwrap();
    assert_eq!(table.string_to_key(&text).unwrap(), 7u32.to_ne_bytes());
    match table.string_to_key("zz") {
        Err(TableError::Parse { input, .. }) => assert_eq!(input, "zz"),
        other => panic!("unexpected {other:?}"),
    }
}

/// Fails the test if a buffer of the wrong length ever reaches the backend,
/// as the kernel would read or write past it
struct SizeAsserting(MemoryMap);

impl SizeAsserting {
    fn assert_key(&self, key: &[u8]) {
        assert_eq!(key.len(), self.0.descriptor().unwrap().key_size, "key reached the backend");
    }

    fn assert_leaf(&self, leaf: &[u8]) {
        let d = self.0.descriptor().unwrap();
        assert_eq!(leaf.len(), d.value_size(self.0.possible_cpus().unwrap()), "leaf reached the backend");
    }
}

impl MapBackend for SizeAsserting {
    fn descriptor(&self) -> Result<MapDescriptor, TableError> {
        self.0.descriptor()
    }

    fn possible_cpus(&self) -> Result<usize, TableError> {
        self.0.possible_cpus()
    }

    fn lookup(&self, key: &[u8], leaf: &mut [u8]) -> io::Result<()> {
        self.assert_key(key);
        self.assert_leaf(leaf);
        self.0.lookup(key, leaf)
    }

    fn update(&self, key: &[u8], leaf: &[u8], flags: u64) -> io::Result<()> {
        self.assert_key(key);
        self.assert_leaf(leaf);
        self.0.update(key, leaf, flags)
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.assert_key(key);
        self.0.delete(key)
    }

    fn first_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.assert_key(key);
        self.0.first_key(key)
    }

    fn next_key(&self, key: &mut [u8]) -> io::Result<()> {
        self.assert_key(key);
        self.0.next_key(key)
    }
}

#[test]
fn test_raw_calls_reject_wrong_sizes_before_the_backend() {
    let table = MapTable::new(SizeAsserting(MemoryMap::new(descriptor(MapKind::Generic, 4, 8))));
    let key = 1u32.to_ne_bytes();
    table.update_from(&key, &5u64.to_ne_bytes()).unwrap();

    let mut short = vec![0u8; 1];
    assert_eq!(table.lookup_into(&key, &mut short).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    assert_eq!(table.update_from(&key, &[0u8; 4]).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    assert_eq!(table.update_from(&[0u8; 2], &[0u8; 8]).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    assert_eq!(table.remove(&[0u8; 8]).unwrap_err().kind(), io::ErrorKind::InvalidInput);

    let mut leaf = [0u8; 8];
    table.lookup_into(&key, &mut leaf).unwrap();
    assert_eq!(leaf, 5u64.to_ne_bytes());
    table.remove(&key).unwrap();
}

#[test]
fn test_raw_lookup_needs_every_cpu_slot() {
    let table = MapTable::new(SizeAsserting(MemoryMap::with_cpus(descriptor(MapKind::PerCpuHash, 4, 8), 4)));
    let key = 1u32.to_ne_bytes();
    let mut single = [0u8; 8];
    assert_eq!(table.lookup_into(&key, &mut single).unwrap_err().kind(), io::ErrorKind::InvalidInput);
}
