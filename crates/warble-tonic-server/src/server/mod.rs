//! Server-side components of the `warble-tonic` compose-post service.
//!
//! This module contains the building blocks necessary to run the gRPC
//! server, including service logic, runtime configuration, and telemetry
//! setup.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and validation.
//! - [`service`] - Core gRPC service implementation: upload handling, id
//!   assignment, and fan-out coordination.
//! - [`telemetry`] - Structured logging plus optional OpenTelemetry export.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod service;
pub mod telemetry;
