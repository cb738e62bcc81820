use capnp;
use capnp::message::Builder;
use capnp::serialize_packed;
use std::io::{BufReader, BufWriter};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use rpc::RpcError;
use rpc_capnp::{rpc_request, rpc_response};

/// A single registered RPC handler. Implementors read their concrete
/// `raft_capnp` request type out of `params` and write their concrete reply
/// type into `result`; the envelope (opcode routing, framing) is handled by
/// `RpcServer` so handlers never see a socket.
pub trait RpcObject: Send + Sync {
    fn handle_rpc(
        &self,
        params: capnp::any_pointer::Reader,
        result: capnp::any_pointer::Builder,
    ) -> Result<(), RpcError>;
}

/// Accepts capnp-framed connections and dispatches each request by opcode
/// to the matching `RpcObject`, one handler call per request, one accepted
/// connection per background thread (matching this codebase's preference
/// for threads over a reactor for anything that isn't the hot replication
/// path).
pub struct RpcServer {
    services: Arc<Vec<(i16, Box<RpcObject>)>>,
    listener: Option<TcpListener>,
}

impl RpcServer {
    pub fn new_with_services(services: Vec<(i16, Box<RpcObject>)>) -> RpcServer {
        RpcServer {
            services: Arc::new(services),
            listener: None,
        }
    }

    pub fn bind(&mut self, addr: (IpAddr, u16)) -> Result<(), RpcError> {
        let listener = TcpListener::bind(addr)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Spawns the accept loop in a background thread and returns
    /// immediately; each accepted connection gets its own handler thread.
    pub fn repl(&mut self) -> Result<(), RpcError> {
        let listener = self
            .listener
            .take()
            .expect("RpcServer::repl called before bind");
        let services = self.services.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let services = services.clone();
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &services) {
                                warn!("rpc connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("rpc accept error: {}", e),
                }
            }
        });
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, services: &[(i16, Box<RpcObject>)]) -> Result<(), RpcError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    loop {
        let message =
            match serialize_packed::read_message(&mut reader, capnp::message::ReaderOptions::new()) {
                Ok(m) => m,
                Err(_) => return Ok(()), // peer closed the connection
            };
        let request = message.get_root::<rpc_request::Reader>()?;
        let opcode = request.get_opcode();
        let params = request.get_params();

        let mut reply = Builder::new_default();
        {
            let response = reply.init_root::<rpc_response::Builder>();
            let result = response.get_result();
            match services.iter().find(|&&(code, _)| code == opcode) {
                Some(&(_, ref handler)) => handler.handle_rpc(params, result)?,
                None => warn!("rpc request for unknown opcode {}", opcode),
            }
        }
        serialize_packed::write_message(&mut writer, &reply)?;
    }
}
