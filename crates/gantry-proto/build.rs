use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    // Build with the vendored protoc so no system install is needed
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let mut config = prost_build::Config::new();
    config.file_descriptor_set_path(out_dir.join("gantry_descriptor.bin"));

    config.compile_protos(
        &[
            PathBuf::from("../../proto/google/api/http.proto"),
            PathBuf::from("../../proto/google/api/annotations.proto"),
            PathBuf::from("../../proto/gantry/system/v1/idp.proto"),
        ],
        &[
            PathBuf::from("../../proto"),
            protoc_bin_vendored::include_path()?,
        ],
    )?;

    println!("cargo:rerun-if-changed=../../proto");
    Ok(())
}
