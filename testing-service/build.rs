use prost::Message;
use std::env::var;
use std::io::Result;

fn main() -> Result<()> {
    // List of proto files containing a service definition
    let proto_files = &[
        "proto/grpc/testing/test.proto",
        "proto/grpc/health/v1/health.proto",
    ];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = var("OUT_DIR").expect("Missing OUT_DIR environment variable");
    let descriptors_path = format!("{}/descriptors.bin", out_dir);

    let file_descriptor_set = protox::compile(proto_files, [proto_folder]).unwrap();
    std::fs::write(descriptors_path, file_descriptor_set.encode_to_vec())?;

    tonic_prost_build::configure()
        .build_client(false)
        .compile_fds(file_descriptor_set)?;

    println!("cargo:rerun-if-changed={proto_folder}");

    Ok(())
}
