//! Command-line interface of the `tracemap` binary

mod args;

pub use args::{Args, Command, SymbolArgs, TableArgs};
