//! # vulnd-core
//!
//! Core library for vulnd - a daemon that orchestrates isolated scans of
//! remote git repositories for CRITICAL vulnerabilities.
//!
//! This crate provides the pure, process-free building blocks of the
//! orchestrator. Everything that spawns workers or touches sockets lives in
//! `vulnd-daemon`; everything here is deterministic state that the daemon
//! serializes behind a mutex.
//!
//! ## Features
//!
//! - **Scan Registry**: bounded in-memory store of scan records with
//!   per-scan vulnerability caps and status-aware eviction
//! - **Job Queue**: bounded FIFO with admission control and a concurrency
//!   gate over an injected processor
//! - **IPC Protocol**: tagged messages and a length-prefixed frame codec
//!   for the orchestrator/worker channel
//! - **Configuration**: environment-driven knobs, read once at startup
//!
//! ## Example
//!
//! ```rust
//! use vulnd_core::registry::{RegistryConfig, ScanRegistry};
//! use vulnd_core::scan::ScanId;
//!
//! let mut registry = ScanRegistry::new(RegistryConfig::default());
//! let id = ScanId::new();
//! let record = registry
//!     .create(id.clone(), "https://github.com/owner/repo".to_string())
//!     .unwrap();
//! assert_eq!(record.scan_id, id);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod ipc;
pub mod queue;
pub mod registry;
pub mod scan;

/// Re-export commonly used types at the crate root.
pub use config::Config;
pub use queue::JobQueue;
pub use registry::ScanRegistry;
pub use scan::{ScanError, ScanErrorCode, ScanId, ScanJob, ScanRecord, ScanStatus, Vulnerability};
