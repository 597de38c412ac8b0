/// Builds the gRPC client and server code for the `warble.proto` definition
/// using `tonic-build`.
///
/// This code generation step processes the Protocol Buffer definitions
/// located in the `proto` directory and emits Rust modules with gRPC
/// bindings into the crate's `OUT_DIR`, along with a serialized file
/// descriptor set used for gRPC server reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/warble.proto`
/// - Includes: `proto/`
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust
/// pub mod warble {
///     tonic::include_proto!("warble");
/// }
/// ```
///
/// This module will include both gRPC service traits and message types.
///
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("warble_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/warble.proto"], &["proto"])
        .unwrap();
}
