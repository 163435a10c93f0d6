//! # tracemap - BPF Map Tables and Symbol Resolution
//!
//! User-space side of BPF instrumentation: byte-exact access to the maps a
//! loaded program writes into, and translation of the instruction pointers
//! it records into symbol names.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  BPF Programs (Kernel, loaded elsewhere)        │
//! │        hash / array / per-CPU / stack-trace maps                │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ bpf(2) element commands
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      tracemap (This Crate)                      │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ MapRegistry  │──▶│   MapTable   │──▶│StackExtractor│         │
//! │  │  (module)    │   │  + Iterator  │   │              │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │ addresses       │
//! │                                               ▼                 │
//! │  ┌──────────────┐                      ┌──────────────┐         │
//! │  │ SymbolModule │                      │ SymbolCache  │         │
//! │  │    Index     │                      │  (per pid)   │         │
//! │  └──────┬───────┘                      └──────┬───────┘         │
//! │         └──────────────┬──────────────────────┘                 │
//! │                        ▼                                        │
//! │                 SymbolBackend (ELF, /proc/pid/maps, kallsyms)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`table`]: map descriptors, the [`table::MapBackend`] capability, raw
//!   get/set/delete/iterate, per-CPU leaf sizing, stack extraction and the
//!   key/leaf text codec
//! - [`module`]: enumerates loaded maps and opens tables by name
//! - [`symbols`]: per-process resolver cache and module symbol index
//! - [`domain`]: newtypes (`Pid`, `MapId`, `StackId`) and error types
//! - [`cli`], [`preflight`]: support for the `tracemap` binary
//!
//! ## Typical Usage
//!
//! ```no_run
//! use tracemap::domain::{Pid, StackId};
//! use tracemap::module::MapRegistry;
//! use tracemap::table::StackExtractor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MapRegistry::from_kernel()?;
//! let mut stacks = StackExtractor::new(registry.open_table("stack_traces")?);
//! for frame in stacks.symbolize_stack(StackId(42), Pid(1234), true) {
//!     println!("{frame}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod domain;
pub mod module;
pub mod preflight;
pub mod symbols;
pub mod table;
