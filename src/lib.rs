//! Warden - task worker resource layer
//!
//! Everything a task worker needs to prepare a task's filesystem and
//! network resources: content-addressed download caches, writable
//! directory caches that persist between tasks, the mounts that place
//! them into a task directory, purge cache reconciliation and per-slot
//! port blocks.

pub mod cache;
pub mod cli;
pub mod clients;
pub mod config;
pub mod content;
pub mod error;
pub mod fsutil;
pub mod mounts;
pub mod ports;
pub mod purge;

pub use error::{WardenError, WardenResult};
