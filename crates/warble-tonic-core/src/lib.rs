#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can access `warble` via
// `warble_tonic_core::warble`
pub use warble;
