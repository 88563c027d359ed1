//! Build script for talos-auto-bootstrap-proto.
//!
//! Compiles the machine API protobuf definitions using tonic-prost-build.
//! Server stubs are generated alongside the clients so tests can run a fake
//! machined endpoint.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo::rerun-if-changed=../../proto/machine/v1/machine.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .emit_rerun_if_changed(true)
        .compile_protos(&["../../proto/machine/v1/machine.proto"], &["../../proto"])?;

    Ok(())
}
