//! System utilities module
//!
//! Provides the provisioning locker used to serialize per-function instance
//! creation.

pub mod locker;

pub use locker::{Locker, LockerGuard};
