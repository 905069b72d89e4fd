fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=../../proto/backend/v1/backend.proto");
    println!("cargo:rerun-if-changed=../../proto");

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["../../proto/backend/v1/backend.proto"], &["../../proto"])?;

    Ok(())
}
