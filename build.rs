fn main() -> Result<(), Box<dyn std::error::Error>> {
    let descriptors = protox::compile(["proto/firecracker/v1/agent.proto"], ["proto"])?;
    tonic_build::configure().compile_fds(descriptors)?;
    println!("cargo:rerun-if-changed=proto/firecracker/v1/agent.proto");
    Ok(())
}
