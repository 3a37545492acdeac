//! Generated protobuf/gRPC types for the log service.

pub mod v1 {
    tonic::include_proto!("log.v1");
}
