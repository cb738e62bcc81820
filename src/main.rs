extern crate consensus_core;
extern crate env_logger;

use std::env;
use std::process;

use consensus_core::{start_server, Config};

fn main() {
    env_logger::init().expect("failed to initialize logger");

    let mut args = env::args().skip(1);
    let self_id: u64 = match args.next().and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => usage(),
    };
    let cluster_path = match args.next() {
        Some(path) => path,
        None => usage(),
    };

    let config = match Config::from_file(&cluster_path, self_id) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bad config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = start_server(config) {
        eprintln!("server exited: {}", e);
        process::exit(1);
    }
}

fn usage() -> ! {
    eprintln!("usage: consensus_core <self-id> <cluster-file>");
    process::exit(1);
}
