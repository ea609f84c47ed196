//! Version subcommand implementation

pub fn run() {
    println!("portmesh {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol {}..={}",
        portmesh::protocol::constants::MIN_PROTOCOL_VERSION,
        portmesh::protocol::constants::MAX_PROTOCOL_VERSION
    );
    println!("target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}
