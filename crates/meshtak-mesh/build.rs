fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
    );

    // Compile protobuf definitions
    prost_build::Config::new().compile_protos(&["proto/atak.proto"], &["proto/"])?;

    Ok(())
}
