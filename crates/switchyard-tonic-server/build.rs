//! Generates the gRPC bindings for `proto/switchyard.proto`.
//!
//! Frame payloads are generated as `Bytes` rather than `Vec<u8>` so a payload
//! moves between the transport and a `switchyard::Frame` without a copy. The
//! encoded descriptor set is written next to the bindings for the reflection
//! service.
//!
//! Generated code is included with:
//!
//! ```rust,ignore
//! pub mod proto {
//!     tonic::include_proto!("switchyard");
//! }
//! ```
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("switchyard_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    // Ensure the payload field is treated as `Bytes`, not `Vec<u8>`
    config
        .bytes([".switchyard.Frame.payload"])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/switchyard.proto"],
        &["proto"],
    )?;
    Ok(())
}
