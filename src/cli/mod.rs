//! Command-line interface
//!
//! Argument parsing for the node binary; the commands themselves run in `main.rs`.

pub mod commands;

pub use commands::{Command, Opt};
