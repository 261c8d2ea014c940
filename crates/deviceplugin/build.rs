fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile_protos(&["proto/deviceplugin.proto"], &["proto"])?;
    tonic_build::configure()
        .build_server(false) // only the kubelet side serves pod resources
        .compile_protos(&["proto/pod_resources.proto"], &["proto"])?;
    Ok(())
}
