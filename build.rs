fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox compiles the proto in-process, so builds don't need a protoc binary.
    let fds = protox::compile(["proto/hostmonitor.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(fds)?;
    println!("cargo:rerun-if-changed=proto/hostmonitor.proto");
    Ok(())
}
