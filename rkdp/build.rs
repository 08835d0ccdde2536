fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/api.proto");
    println!("cargo:rerun-if-env-changed=RKDP_GIT_TAG");
    println!("cargo:rerun-if-env-changed=RKDP_GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=RKDP_BUILD_DATE");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
