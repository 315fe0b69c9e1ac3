//! # msync device
//!
//! Runs the msync engine on a device: the engine state and operation log
//! live in SQLite, bundles are read from and written to files.
//!
//! [`SyncNode`] is the entry point. Every change goes through it so that the
//! database and the in-memory store never disagree.

pub mod config;
pub mod db;
pub mod error;
pub mod node;

pub use config::{Config, ConfigError};
pub use error::{DeviceError, Result};
pub use node::{ExportResult, NodeOptions, NodeStatus, SyncNode};
