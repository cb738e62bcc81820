use capnp;
use capnp::message::{Builder, HeapAllocator, Reader};
use capnp::serialize::OwnedSegments;
use capnp::serialize_packed;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use common::RPC_TIMEOUT;
use rpc::RpcError;
use rpc_capnp::{rpc_request, rpc_response};

/// A single outbound capnp-framed RPC: an opcode plus a params payload the
/// caller fills in via `get_param_builder`, sent blocking over a fresh TCP
/// connection with `RPC_TIMEOUT` read/write deadlines.
pub struct Rpc {
    message: Builder<HeapAllocator>,
}

impl Rpc {
    pub fn new(opcode: i16) -> Rpc {
        let mut message = Builder::new_default();
        {
            let mut request = message.init_root::<rpc_request::Builder>();
            request.set_opcode(opcode);
        }
        Rpc { message: message }
    }

    /// Returns the `AnyPointer` builder for this request's params, to be
    /// initialized as whichever concrete `raft_capnp` struct the opcode
    /// implies (e.g. `request_vote::Builder`).
    pub fn get_param_builder(&mut self) -> capnp::any_pointer::Builder {
        self.message
            .get_root::<rpc_request::Builder>()
            .unwrap()
            .get_params()
    }

    /// Connects to `addr`, writes this request, and blocks for a reply.
    pub fn send(&self, addr: SocketAddr) -> Result<Reader<OwnedSegments>, RpcError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_millis(RPC_TIMEOUT)))?;
        stream.set_write_timeout(Some(Duration::from_millis(RPC_TIMEOUT)))?;
        {
            let mut writer = BufWriter::new(&stream);
            serialize_packed::write_message(&mut writer, &self.message)?;
        }
        let mut reader = BufReader::new(&stream);
        let reply = serialize_packed::read_message(&mut reader, capnp::message::ReaderOptions::new())?;
        Ok(reply)
    }

    /// Extracts the `AnyPointer` result out of a decoded `RpcResponse`.
    pub fn get_result_reader<'a>(
        msg: &'a Reader<OwnedSegments>,
    ) -> Result<capnp::any_pointer::Reader<'a>, RpcError> {
        let response = msg.get_root::<rpc_response::Reader>()?;
        Ok(response.get_result())
    }
}
