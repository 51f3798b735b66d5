//! faasd - lightweight FaaS control-plane daemon library.
//!
//! Provisions isolated execution instances (process or container sandboxes)
//! for registered functions, dispatches invocations to a warm pool, and
//! keeps that pool autoscaled and reaped.

pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod system;

pub use config::Configuration;
pub use error::{DaemonError, Result};
