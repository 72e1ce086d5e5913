//! # vulnd-daemon
//!
//! The vulnd daemon: accepts scan requests over a Unix-socket control
//! plane, admits them through the bounded job queue, and runs each scan in
//! an isolated worker process supervised by the worker manager.
//!
//! The same binary serves both roles: `vulnd serve` runs the orchestrator,
//! and the orchestrator re-executes itself with the hidden `worker`
//! subcommand for each scan. Worker processes talk to the daemon over a
//! socketpair installed on file descriptor 3, leaving stdout free (ignored)
//! and stderr free for crash fingerprinting.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod engine;
pub mod manager;
pub mod sandbox;
pub mod server;
pub mod worker;
