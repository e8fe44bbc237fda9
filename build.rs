fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the controller-facing Openolt schema and the admin API schema.
    // NOTE: type_attribute adds #[allow(missing_docs)] to all generated types
    // since protobuf-generated code cannot have doc comments at source
    // Use a vendored protoc binary so the build does not require a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[allow(missing_docs)]")
        .compile(&["proto/openolt.proto", "proto/admin.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
