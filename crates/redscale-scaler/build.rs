fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protoc is not installed system-wide in all build environments, so point
    // tonic-build at the binary shipped by the protoc-bin-vendored crate.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // Safe: single-threaded build script, set before any proto compilation.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }
    tonic_build::compile_protos("proto/externalscaler.proto")?;
    Ok(())
}
