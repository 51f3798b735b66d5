//! Configuration management module
//!
//! Loads the daemon's TOML configuration file into typed, validated structs.

mod config;

pub use config::*;
