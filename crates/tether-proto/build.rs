use anyhow::Result;
use std::path::PathBuf;

const PROTO: &str = "proto/tether.proto";

fn main() -> Result<()> {
    // Safety: build scripts run in a controlled single-process environment.
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    println!("cargo:rerun-if-changed={PROTO}");

    // Messages only; frames travel over plain TCP, not gRPC.
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(false)
        .compile_protos(&[PathBuf::from(PROTO)], &[PathBuf::from("proto"), protoc_bin_vendored::include_path()?])?;
    Ok(())
}
