//! CLI command handlers

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Report process- and container-executor readiness
    Diagnostics,
}
