//! Shared constants, configuration, and the crate-wide error type.
//!
//! Kept separate from `server` and `rpc` because both depend on it: a
//! sibling module carrying the numbers and error type both the core and
//! the transport need, alongside `server` (the state machine).

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;

use rustc_serialize::json::Json;

use rpc::RpcError;

// Opcodes for the capnp-framed peer RPCs. These index into the service
// table the RPC server is constructed with; see `rpc::server`.
pub const PRE_REQUEST_VOTE_OPCODE: i16 = 0;
pub const REQUEST_VOTE_OPCODE: i16 = 1;
pub const HEARTBEAT_OPCODE: i16 = 2;
pub const APPEND_ENTRY_OPCODE: i16 = 3;

/// Base election timeout. Followers randomize into `[ELECTION_TIMEOUT_MIN,
/// ELECTION_TIMEOUT_MAX)` to avoid synchronized elections; pre-vote rounds
/// restart the timer at the fixed base value.
pub const ELECTION_TIMEOUT_MIN: u64 = 150;
pub const ELECTION_TIMEOUT_MAX: u64 = 300;
/// Fixed duration bounding the candidate phase.
pub const VOTE_TIMEOUT: u64 = 150;
/// Must stay strictly less than ELECTION_TIMEOUT_MIN so a live leader's
/// heartbeats always beat a follower's election timer.
pub const HEARTBEAT_TIMEOUT: u64 = 50;
/// Deadline carried by outbound append_entry RPCs; on expiry the transport
/// clears the peer's `paused` flag so the next opportunity retries.
pub const RPC_TIMEOUT: u64 = 100;

/// Errors that can cross out of this crate's transport/config boundary.
/// Transport-level causes are wrapped rather than duplicated; see
/// `rpc::RpcError` for the lower layer.
#[derive(Debug)]
pub enum RaftError {
    Rpc(RpcError),
    /// The peer didn't reply within `RPC_TIMEOUT`.
    Timeout,
    /// The cluster config file was malformed.
    Config(String),
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RaftError::Rpc(ref e) => write!(f, "rpc error: {}", e),
            RaftError::Timeout => write!(f, "rpc timed out"),
            RaftError::Config(ref s) => write!(f, "bad config: {}", s),
        }
    }
}

impl Error for RaftError {
    fn description(&self) -> &str {
        match *self {
            RaftError::Rpc(_) => "rpc error",
            RaftError::Timeout => "rpc timed out",
            RaftError::Config(_) => "bad config",
        }
    }
}

impl From<io::Error> for RaftError {
    fn from(e: io::Error) -> RaftError {
        RaftError::Rpc(RpcError::Io(e))
    }
}

impl From<RpcError> for RaftError {
    fn from(e: RpcError) -> RaftError {
        RaftError::Rpc(e)
    }
}

/// Cluster membership and per-node identity. Each server has a unique
/// 64-bit id and socket address; these mappings MUST be identical on every
/// node in the cluster.
pub struct Config {
    pub cluster: HashMap<u64, SocketAddr>,
    pub me: (u64, SocketAddr),
    pub heartbeat_timeout: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub vote_timeout: Duration,
}

impl Config {
    pub fn new(cluster: HashMap<u64, SocketAddr>, my_id: u64, my_addr: SocketAddr) -> Config {
        Config {
            cluster: cluster,
            me: (my_id, my_addr),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT),
            election_timeout_min: Duration::from_millis(ELECTION_TIMEOUT_MIN),
            election_timeout_max: Duration::from_millis(ELECTION_TIMEOUT_MAX),
            vote_timeout: Duration::from_millis(VOTE_TIMEOUT),
        }
    }

    /// Parses a cluster file holding a JSON array of `{"id": .., "addr":
    /// ..}` objects (one per node, including self) and splits out
    /// `self_id` as this node's identity.
    pub fn from_file(path: &str, self_id: u64) -> Result<Config, RaftError> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let json = Json::from_str(&contents)
            .map_err(|e| RaftError::Config(format!("invalid json: {}", e)))?;
        let nodes = json
            .as_array()
            .ok_or_else(|| RaftError::Config("cluster file must be a JSON array".to_string()))?;

        let mut cluster = HashMap::new();
        for node in nodes {
            let id = node
                .find("id")
                .and_then(Json::as_u64)
                .ok_or_else(|| RaftError::Config(format!("missing/bad id in: {}", node)))?;
            let addr_str = node
                .find("addr")
                .and_then(Json::as_string)
                .ok_or_else(|| RaftError::Config(format!("missing addr in: {}", node)))?;
            let addr: SocketAddr = addr_str
                .parse()
                .map_err(|_| RaftError::Config(format!("bad address: {}", addr_str)))?;
            cluster.insert(id, addr);
        }
        let me = *cluster.get(&self_id).ok_or_else(|| {
            RaftError::Config(format!("self_id {} not present in cluster file", self_id))
        })?;
        Ok(Config::new(cluster, self_id, me))
    }
}
