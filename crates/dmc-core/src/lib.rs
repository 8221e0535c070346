//! DMC Core - Business logic for the DMC device-management control plane.
//!
//! This crate implements:
//! - Configuration profile verification against device check-ins
//! - Remote lock, unlock, and wipe requests with one open action per device
//! - Capability resolution and the per-platform delivery matrix
//! - Correlation of asynchronous command and script results
//! - Persistent storage abstraction
//! - Audit event generation

#![forbid(unsafe_code)]

// Services
pub mod verification;
pub mod actions;
pub mod correlator;
pub mod capability;
pub mod transport;

// Infrastructure
pub mod store;
pub mod repair;
pub mod audit;
pub mod config;

// Supporting modules
pub mod errors;
pub mod types;
pub mod harness;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;
