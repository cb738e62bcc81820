//! Peer transport, the replication driver's transport half: one
//! background thread per peer, fed by an `mpsc` channel, that turns a
//! consensus message into a capnp RPC, blocks for the reply, and reports
//! the outcome back to the run loop as an `Event`. Keeping one thread per
//! peer (rather than a shared connection pool) means a slow or wedged peer
//! never stalls delivery to the others.

use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use common::{APPEND_ENTRY_OPCODE, HEARTBEAT_OPCODE, PRE_REQUEST_VOTE_OPCODE, REQUEST_VOTE_OPCODE};
use event::Event;
use raft_capnp::{append_entry, append_entry_reply, heartbeat, heartbeat_reply, request_vote,
                  request_vote_reply};
use rpc::client::Rpc;
use rpc::RpcError;
use server::core::{AppendEntryArgs, AppendEntryReply, HeartbeatArgs, HeartbeatReply,
                    RequestVoteArgs, RequestVoteReply};

/// What the run loop hands a peer thread to send next. Each variant also
/// carries the term it was issued under, so a stale reply arriving after
/// the core has moved on can still be tagged correctly for the response
/// handler to discard.
pub enum PeerThreadMessage {
    RequestVote {
        is_pre_vote: bool,
        term_at_send: u64,
        args: RequestVoteArgs,
    },
    Heartbeat {
        args: HeartbeatArgs,
    },
    AppendEntries {
        term_at_send: u64,
        args: AppendEntryArgs,
    },
    Shutdown,
}

/// The run loop's handle onto a peer's background thread: just the
/// channel to feed it and its id, since the thread owns everything else
/// (socket address, the reply channel back to the run loop).
pub struct PeerHandle {
    pub id: u64,
    to_peer: Sender<PeerThreadMessage>,
}

impl PeerHandle {
    pub fn send(&self, message: PeerThreadMessage) {
        // A closed peer thread means shutdown is in progress; nothing to do.
        let _ = self.to_peer.send(message);
    }
}

/// Spawns the background thread for one peer and returns the handle the
/// run loop drives it through.
pub fn start(id: u64, addr: SocketAddr, to_main: Sender<Event>) -> PeerHandle {
    let (to_peer, from_main) = channel();
    let peer = Peer {
        id: id,
        addr: addr,
        to_main: to_main,
        from_main: from_main,
    };
    thread::spawn(move || peer.run());
    PeerHandle {
        id: id,
        to_peer: to_peer,
    }
}

struct Peer {
    id: u64,
    addr: SocketAddr,
    to_main: Sender<Event>,
    from_main: Receiver<PeerThreadMessage>,
}

impl Peer {
    fn run(self) {
        loop {
            match self.from_main.recv() {
                Ok(PeerThreadMessage::RequestVote {
                    is_pre_vote,
                    term_at_send,
                    args,
                }) => self.send_request_vote(is_pre_vote, term_at_send, args),
                Ok(PeerThreadMessage::Heartbeat { args }) => self.send_heartbeat(args),
                Ok(PeerThreadMessage::AppendEntries { term_at_send, args }) => {
                    self.send_append_entries(term_at_send, args)
                }
                Ok(PeerThreadMessage::Shutdown) | Err(_) => return,
            }
        }
    }

    fn send_request_vote(&self, is_pre_vote: bool, term_at_send: u64, args: RequestVoteArgs) {
        let opcode = if is_pre_vote {
            PRE_REQUEST_VOTE_OPCODE
        } else {
            REQUEST_VOTE_OPCODE
        };
        let mut rpc = Rpc::new(opcode);
        {
            let mut builder = rpc
                .get_param_builder()
                .init_as::<request_vote::Builder>();
            builder.set_from(args.from);
            builder.set_term(args.term);
            builder.set_last_log_idx(args.last_log_idx);
            builder.set_last_log_term(args.last_log_term);
        }
        let reply = self
            .send_and_parse(rpc, |reader| {
                let r = reader.get_as::<request_vote_reply::Reader>()?;
                Ok(RequestVoteReply {
                    term: r.get_term(),
                    granted: r.get_granted(),
                })
            })
            .ok();
        let _ = self.to_main.send(Event::RequestVoteResponse {
            peer_id: self.id,
            term_at_send: term_at_send,
            is_pre_vote: is_pre_vote,
            reply: reply,
        });
    }

    fn send_heartbeat(&self, args: HeartbeatArgs) {
        let mut rpc = Rpc::new(HEARTBEAT_OPCODE);
        {
            let mut builder = rpc.get_param_builder().init_as::<heartbeat::Builder>();
            builder.set_from(args.from);
            builder.set_term(args.term);
            builder.set_leader_commit_index(args.leader_commit_index);
        }
        let reply = self
            .send_and_parse(rpc, |reader| {
                let r = reader.get_as::<heartbeat_reply::Reader>()?;
                Ok(HeartbeatReply {
                    from: r.get_from(),
                    term: r.get_term(),
                })
            })
            .ok();
        let _ = self.to_main.send(Event::HeartbeatResponse {
            peer_id: self.id,
            reply: reply,
        });
    }

    fn send_append_entries(&self, term_at_send: u64, args: AppendEntryArgs) {
        let mut rpc = Rpc::new(APPEND_ENTRY_OPCODE);
        {
            let mut builder = rpc.get_param_builder().init_as::<append_entry::Builder>();
            builder.set_from(args.from);
            builder.set_term(args.term);
            builder.set_prev_log_index(args.prev_log_index);
            builder.set_prev_log_term(args.prev_log_term);
            builder.set_leader_commit_index(args.leader_commit_index);
            let mut entries = builder.borrow().init_entries(args.entries.len() as u32);
            for (i, e) in args.entries.iter().enumerate() {
                let mut entry_builder = entries.borrow().get(i as u32);
                e.into_proto(&mut entry_builder);
            }
        }
        let reply = self
            .send_and_parse(rpc, |reader| {
                let r = reader.get_as::<append_entry_reply::Reader>()?;
                Ok(AppendEntryReply {
                    from: r.get_from(),
                    term: r.get_term(),
                    last_log_index: r.get_last_log_index(),
                    reject: r.get_reject(),
                    reject_hint: r.get_reject_hint(),
                })
            })
            .ok();
        let _ = self.to_main.send(Event::AppendEntryResponse {
            peer_id: self.id,
            term_at_send: term_at_send,
            reply: reply,
        });
    }

    fn send_and_parse<T, F>(&self, rpc: Rpc, parse: F) -> Result<T, RpcError>
    where
        F: FnOnce(::capnp::any_pointer::Reader) -> Result<T, ::capnp::Error>,
    {
        let message = rpc.send(self.addr)?;
        let result = Rpc::get_result_reader(&message)?;
        Ok(parse(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capnp::message::Builder;
    use capnp::serialize_packed;
    use server::log::Entry;

    #[test]
    fn append_entries_round_trips_through_capnp() {
        let entries = vec![
            Entry {
                index: 1,
                term: 1,
                data: vec![1, 2, 3],
            },
            Entry {
                index: 2,
                term: 1,
                data: vec![],
            },
        ];
        let mut message = Builder::new_default();
        {
            let mut builder = message.init_root::<append_entry::Builder>();
            builder.set_from(1);
            builder.set_term(4);
            builder.set_prev_log_index(0);
            builder.set_prev_log_term(0);
            builder.set_leader_commit_index(0);
            let mut list = builder.borrow().init_entries(entries.len() as u32);
            for (i, e) in entries.iter().enumerate() {
                let mut b = list.borrow().get(i as u32);
                e.into_proto(&mut b);
            }
        }
        let mut bytes = Vec::new();
        serialize_packed::write_message(&mut bytes, &message).unwrap();
        let reader = serialize_packed::read_message(
            &mut &bytes[..],
            ::capnp::message::ReaderOptions::new(),
        ).unwrap();
        let parsed = reader.get_root::<append_entry::Reader>().unwrap();
        assert_eq!(parsed.get_term(), 4);
        let parsed_entries = parsed.get_entries().unwrap();
        assert_eq!(parsed_entries.len(), 2);
        let roundtripped = Entry::from_proto(parsed_entries.get(0));
        assert_eq!(roundtripped, entries[0]);
    }
}
