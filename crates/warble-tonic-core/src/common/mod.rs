pub mod error;
pub mod types;

/// Generated protobuf messages and gRPC bindings for the `warble` package.
pub mod proto {
    tonic::include_proto!("warble");

    /// Serialized file descriptor set, used for gRPC server reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/warble_descriptor.bin"));
}

pub use error::*;
