extern crate capnp;
extern crate rand;
#[macro_use]
extern crate log;
extern crate mio;
extern crate rustc_serialize;
#[cfg(test)]
#[macro_use]
extern crate matches;

pub mod rpc_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_capnp.rs"));
}

pub mod raft_capnp {
    include!(concat!(env!("OUT_DIR"), "/raft_capnp.rs"));
}

pub mod common;
pub mod event;
pub mod rpc;
pub mod timer;
pub mod server;

pub use common::{Config, RaftError};
pub use server::{start_server, Role};
