//! Build script for the Meridian station server
//!
//! Generates the `StationTransfer` gRPC client and server from manual
//! service definitions. Message types are hand-written prost structs in
//! `src/grpc.rs`, so no protoc is needed.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic_prost::ProstCodec")
        .build()
}

fn main() {
    let transfer = Service::builder()
        .name("StationTransfer")
        .package("meridian.station")
        .method(method(
            "lookup_permission",
            "LookupPermission",
            "crate::grpc::PermissionQuery",
            "crate::grpc::PermissionReply",
        ))
        .method(method(
            "transfer_agent",
            "TransferAgent",
            "crate::grpc::TransferEnvelope",
            "crate::grpc::TransferReply",
        ))
        .build();

    Builder::new().compile(&[transfer]);

    println!("cargo:rerun-if-changed=build.rs");
}
