use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracemap::domain::{Pid, SymbolError};
use tracemap::symbols::{
    Resolution, SymbolBackend, SymbolCache, SymbolLocation, SymbolModuleIndex, SymbolOptions,
    SymbolResolver, SystemSymbols,
};

/// Backend over a fixed symbol list that counts scans and opened handles
#[derive(Default)]
struct Recording {
    scans: AtomicUsize,
    opens: AtomicUsize,
    locates: AtomicUsize,
}

struct Fixed;

impl SymbolResolver for Fixed {
    fn resolve(&mut self, addr: u64) -> Resolution {
        match addr {
            0x400..=0x4ff => Resolution::Symbol {
                name: "foo_main".to_string(),
                module: "/opt/app".to_string(),
                offset: addr - 0x400,
            },
            0x500..=0xfff => Resolution::Module { module: "/opt/app".to_string(), offset: addr },
            _ => Resolution::Unknown,
        }
    }

    fn resolve_name(&mut self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        if name == "foo_main" {
            Ok(SymbolLocation { module: "/opt/app".to_string(), address: 0x7f00_0000_0400, offset: 0x400 })
        } else {
            Err(SymbolError::NotFound { module: module.to_string(), name: name.to_string() })
        }
    }
}

impl SymbolBackend for Recording {
    fn open(&self, _: Pid, _: &SymbolOptions) -> Result<Box<dyn SymbolResolver>, SymbolError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Fixed))
    }

    fn for_each_function_symbol(&self, _: &str, visit: &mut dyn FnMut(&str, u64)) -> Result<(), SymbolError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        for (name, addr) in [("foo_main", 0x400), ("bar", 0x500), ("foo_exit", 0x600), ("afoo_", 0x700)] {
            visit(name, addr);
        }
        Ok(())
    }

    fn locate_in_module(&self, module: &str, name: &str) -> Result<SymbolLocation, SymbolError> {
        self.locates.fetch_add(1, Ordering::SeqCst);
        if name == "foo_main" {
            Ok(SymbolLocation { module: "/opt/app".to_string(), address: 0x400, offset: 0x400 })
        } else {
            Err(SymbolError::NotFound { module: module.to_string(), name: name.to_string() })
        }
    }
}

#[test]
fn test_cache_output_formats() {
    let mut cache = SymbolCache::new(Arc::new(Recording::default()), SymbolOptions::default());
    assert_eq!(cache.resolve(Pid(10), 0x410), "foo_main");
    assert_eq!(cache.resolve(Pid(10), 0x600), "[m] /opt/app + 0x00000600");
    assert_eq!(cache.resolve(Pid(10), 0x10_0000), "0x0000000000100000");
}

#[test]
fn test_one_handle_per_pid_until_released() {
    let backend = Arc::new(Recording::default());
    let mut cache = SymbolCache::new(backend.clone(), SymbolOptions::default());
    for _ in 0..3 {
        cache.resolve(Pid(10), 0x410);
    }
    assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

    assert!(cache.release(Pid(10)));
    assert!(!cache.release(Pid(10)));
    cache.resolve(Pid(10), 0x410);
    assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
}

#[test]
fn test_index_scans_each_module_once() {
    let backend = Arc::new(Recording::default());
    let index = SymbolModuleIndex::new(backend.clone());
    let first = index.list_symbols("/opt/app").unwrap();
    let second = index.list_symbols("/opt/app").unwrap();
    assert_eq!(first, second);
    index.list_symbols("/opt/other").unwrap();
    assert_eq!(backend.scans.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_first_listing_scans_once() {
    let backend = Arc::new(Recording::default());
    let index = Arc::new(SymbolModuleIndex::new(backend.clone()));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let index = Arc::clone(&index);
            thread::spawn(move || index.list_symbols("/opt/app").unwrap().len())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 4);
    }
    assert_eq!(backend.scans.load(Ordering::SeqCst), 1);
}

#[test]
fn test_match_symbols_filters_in_order() {
    let backend = Arc::new(Recording::default());
    let index = SymbolModuleIndex::new(backend.clone());
    let names: Vec<String> = index.match_symbols("/opt/app", "^foo_").unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["foo_main", "foo_exit"]);
    index.match_symbols("/opt/app", "exit$").unwrap();
    assert_eq!(backend.scans.load(Ordering::SeqCst), 1);

    let err = index.match_symbols("/opt/app", "foo_(").unwrap_err();
    assert!(matches!(err, SymbolError::InvalidPattern { .. }));
}

#[test]
fn test_point_lookups_use_throwaway_handles() {
    let backend = Arc::new(Recording::default());
    let index = SymbolModuleIndex::new(backend.clone());
    assert_eq!(index.resolve_address_for_name("app", "foo_main", Pid(3)).unwrap(), ("/opt/app".to_string(), 0x400));
    assert_eq!(index.resolve_name_to_address("app", "foo_main", Pid(3)).unwrap(), 0x7f00_0000_0400);
    assert!(matches!(
        index.resolve_name_to_address("app", "missing", Pid(3)),
        Err(SymbolError::NotFound { .. })
    ));
    assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
    assert_eq!(backend.scans.load(Ordering::SeqCst), 0);
}

#[test]
fn test_kernel_pid_reads_user_modules_from_file() {
    let backend = Arc::new(Recording::default());
    let index = SymbolModuleIndex::new(backend.clone());
    assert_eq!(index.resolve_address_for_name("app", "foo_main", Pid::KERNEL).unwrap(), ("/opt/app".to_string(), 0x400));
    assert_eq!(index.resolve_name_to_address("app", "foo_main", Pid(-7)).unwrap(), 0x400);
    assert!(matches!(
        index.resolve_name_to_address("app", "missing", Pid::KERNEL),
        Err(SymbolError::NotFound { .. })
    ));
    assert_eq!(backend.locates.load(Ordering::SeqCst), 3);
    assert_eq!(backend.opens.load(Ordering::SeqCst), 0);

    index.resolve_name_to_address("kernel", "foo_main", Pid::KERNEL).unwrap();
    index.resolve_name_to_address("[kernel]", "foo_main", Pid::KERNEL).unwrap();
    assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
    assert_eq!(backend.locates.load(Ordering::SeqCst), 3);
}

#[inline(never)]
#[allow(unsafe_code)]
#[no_mangle]
pub extern "C" fn tracemap_test_marker() -> u64 {
    std::hint::black_box(0x5eed)
}

#[test]
fn test_resolves_function_in_own_binary() {
    let addr = tracemap_test_marker as usize as u64;
    let pid = Pid(std::process::id() as i32);

    let mut cache = SymbolCache::system();
    assert_eq!(cache.resolve(pid, addr), "tracemap_test_marker");
    assert_eq!(cache.resolve(pid, addr + 1), "tracemap_test_marker");
    assert_eq!(cache.resolve(pid, 0x10), "0x0000000000000010");
}

#[test]
fn test_eager_handle_resolves_like_lazy() {
    let addr = tracemap_test_marker as usize as u64;
    let pid = Pid(std::process::id() as i32);
    let mut cache = SymbolCache::new(Arc::new(SystemSymbols::new()), SymbolOptions::default().with_lazy_symbolize(false));
    assert_eq!(cache.symbol_name(pid, addr).as_deref(), Some("tracemap_test_marker"));
}

#[test]
fn test_locates_function_in_own_binary() {
    let exe = std::env::current_exe().unwrap();
    let exe = exe.to_str().unwrap();
    let pid = Pid(std::process::id() as i32);
    let index = SymbolModuleIndex::new(Arc::new(SystemSymbols::new()));

    let listed = index.match_symbols(exe, "^tracemap_test_marker$").unwrap();
    assert_eq!(listed.len(), 1);

    let addr = index.resolve_name_to_address(exe, "tracemap_test_marker", pid).unwrap();
    assert_eq!(addr, tracemap_test_marker as usize as u64);
}

#[test]
fn test_locates_user_symbol_without_a_process() {
    let exe = std::env::current_exe().unwrap();
    let exe = exe.to_str().unwrap();
    let index = SymbolModuleIndex::new(Arc::new(SystemSymbols::new()));
    let listed = index.match_symbols(exe, "^tracemap_test_marker$").unwrap();

    let addr = index.resolve_name_to_address(exe, "tracemap_test_marker", Pid::KERNEL).unwrap();
    assert_eq!(addr, listed[0].address);

    let (module, offset) = index.resolve_address_for_name(exe, "tracemap_test_marker", Pid::KERNEL).unwrap();
    assert_eq!(module, exe);
    let mapped = index.resolve_address_for_name(exe, "tracemap_test_marker", Pid(std::process::id() as i32)).unwrap();
    assert_eq!(offset, mapped.1);
}
