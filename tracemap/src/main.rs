//! # tracemap - Main Entry Point
//!
//! Diagnostic front end over the library: list loaded maps, dump or clear
//! a map, read and symbolize stacks, and query symbol tables.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tracemap::cli::{Args, Command, TableArgs};
use tracemap::domain::{MapId, Pid, StackId};
use tracemap::module::MapRegistry;
use tracemap::preflight::{check_proc_access, run_preflight_checks};
use tracemap::symbols::{SymbolCache, SymbolModuleIndex, SymbolOptions, SystemSymbols};
use tracemap::table::{KernelMap, MapTable, StackExtractor};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else if msg.contains("no table named") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Maps => list_maps(),
        Command::Dump { table } => dump(&table),
        Command::Clear { table } => {
            let (name, table) = open_table(&table)?;
            table.delete_all().with_context(|| format!("Failed to clear {name}"))?;
            println!("Cleared {name}");
            Ok(())
        }
        Command::Stack { table, stack_id, pid, clear, symbols } => {
            let (_, table) = open_table(&table)?;
            let options = symbols.apply(SymbolOptions::for_table());
            let cache = SymbolCache::new(Arc::new(SystemSymbols::new()), options);
            let mut stacks = StackExtractor::with_symbols(table, cache);
            let pid = Pid(pid);

            let addresses = stacks
                .try_resolve_stack(StackId(stack_id), clear)
                .with_context(|| format!("Failed to read stack {stack_id}"))?;
            for (i, addr) in addresses.into_iter().enumerate() {
                let name = stacks.symbols_mut().resolve(pid, addr);
                println!("#{i:<2} 0x{addr:016x} {name}");
            }
            Ok(())
        }
        Command::Symbolize { pid, addresses, symbols } => {
            check_proc_access(pid)?;
            let mut cache = SymbolCache::new(Arc::new(SystemSymbols::new()), symbols.options());
            for addr in addresses {
                println!("0x{addr:016x} {}", cache.resolve(Pid(pid), addr));
            }
            Ok(())
        }
        Command::Symbols { module, pattern } => {
            let index = SymbolModuleIndex::global();
            let symbols = match pattern {
                Some(pattern) => index.match_symbols(&module, &pattern)?,
                None => index.list_symbols(&module)?.to_vec(),
            };
            for sym in symbols {
                println!("0x{:016x} {}", sym.address, sym.name);
            }
            Ok(())
        }
        Command::Locate { module, symbol, pid } => {
            let index = SymbolModuleIndex::global();
            let pid = Pid(pid);
            let (path, offset) = index.resolve_address_for_name(&module, &symbol, pid)?;
            let address = index.resolve_name_to_address(&module, &symbol, pid)?;
            println!("{symbol}: module {path} offset 0x{offset:x} address 0x{address:016x}");
            Ok(())
        }
    }
}

fn list_maps() -> Result<()> {
    run_preflight_checks()?;
    let registry = MapRegistry::from_kernel().context("Failed to enumerate BPF maps")?;

    println!("{:>6}  {:<16} {:<14} {:>5} {:>6} {:>8}", "ID", "NAME", "KIND", "KEY", "LEAF", "MAX");
    for m in registry.descriptors() {
        println!(
            "{:>6}  {:<16} {:<14} {:>5} {:>6} {:>8}",
            m.id.0,
            m.name,
            format!("{:?}", m.kind),
            m.key_size,
            m.leaf_size,
            m.capacity
        );
    }
    Ok(())
}

fn open_table(args: &TableArgs) -> Result<(String, MapTable<KernelMap>)> {
    run_preflight_checks()?;
    let mut registry = MapRegistry::from_kernel().context("Failed to enumerate BPF maps")?;
    if let Some(path) = &args.layout {
        registry.load_layouts(path).with_context(|| format!("Failed to load {}", path.display()))?;
    }

    let id = match (&args.name, args.id) {
        (_, Some(id)) => MapId(id),
        (Some(name), None) => registry
            .table_id_by_name(name)
            .with_context(|| format!("no table named {name}"))?,
        (None, None) => anyhow::bail!("no table named: pass --id or --name"),
    };
    let name = registry.descriptor_for(id).map_or_else(|| id.to_string(), |d| d.name.clone());
    let table = registry.open_table_by_id(id).with_context(|| format!("Failed to open {name}"))?;
    info!("Opened {name} ({id})");
    Ok((name, table))
}

fn dump(args: &TableArgs) -> Result<()> {
    let (name, table) = open_table(args)?;
    let mut iter = table.iter();
    let mut count = 0usize;
    while iter.advance() {
        if let (Some(key), Some(leaf)) = (iter.key(), iter.leaf()) {
            println!("{} => {}", table.key_to_string(key)?, table.leaf_to_string(leaf)?);
            count += 1;
        }
    }
    if let Some(err) = iter.take_err() {
        return Err(err).with_context(|| format!("Walk over {name} stopped after {count} entries"));
    }
    println!("{count} entries");
    Ok(())
}
