//! Cap'n Proto-framed request/response transport. Raft knows nothing about
//! sockets; everything below is generic opcode-dispatched RPC plumbing that
//! `server::peer` and `rpc::server` build the actual consensus calls on top
//! of (see `raft_capnp` for the concrete schemas carried as `params`).

pub mod client;
pub mod server;

use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum RpcError {
    Io(io::Error),
    Capnp(::capnp::Error),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RpcError::Io(ref e) => write!(f, "io error: {}", e),
            RpcError::Capnp(ref e) => write!(f, "capnp error: {}", e),
        }
    }
}

impl Error for RpcError {
    fn description(&self) -> &str {
        match *self {
            RpcError::Io(_) => "io error",
            RpcError::Capnp(_) => "capnp error",
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> RpcError {
        RpcError::Io(e)
    }
}

impl From<::capnp::Error> for RpcError {
    fn from(e: ::capnp::Error) -> RpcError {
        RpcError::Capnp(e)
    }
}
