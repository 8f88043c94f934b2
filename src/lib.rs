//! rexec core — connection descriptors and command execution
//!
//! Describes how to reach remote machines (with an optional bastion hop),
//! resolves values deferred by an orchestrator, runs local commands, and
//! exposes all of it through a C FFI interface.

pub mod connection;
pub mod error;
pub mod ffi;
pub mod local;
pub mod resolve;

pub use connection::{Connection, ConnectionArgs, Input, ProxyConnection, ProxyConnectionArgs};
pub use error::ConnectionError;
