pub mod config;
pub mod metrics;
pub mod service;
pub mod telemetry;
pub mod transport;

pub mod proto {
    tonic::include_proto!("switchyard");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("switchyard_descriptor");
}
