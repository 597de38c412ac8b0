//! gRPC service implementation for post composition.
//!
//! This module contains the core logic for handling client-facing gRPC
//! requests: buffering component uploads, assigning post ids, and running
//! finalization and fan-out through the compose core. It implements both
//! services from the protobuf schema and coordinates graceful shutdown.
//!
//! ## Structure
//!
//! - [`config`] - Concrete clock, generator, and aggregator type aliases.
//! - [`handler`] - gRPC service entry point (`ComposeService`).

pub mod config;
pub mod handler;
