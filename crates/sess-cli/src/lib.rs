//! Sessionization CLI library.
//!
//! This crate provides the CLI interface for the sessionization engine.

mod cli;
pub mod commands;
mod config;
mod util;

pub use cli::{Cli, Commands, RunArgs};
pub use config::Config;
pub use util::parse_duration;
