use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=proto/nativetrace.proto");

    let mut config = prost_build::Config::new();
    // Use the bundled compiler unless the environment names one
    if std::env::var_os("PROTOC").is_none() {
        config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);
    }
    config.compile_protos(&["proto/nativetrace.proto"], &["proto/"])?;
    Ok(())
}
