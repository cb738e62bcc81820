//! The consensus core's public face: wires `core::Core` (state + log +
//! timers) together with the peer transport and the capnp RPC server into
//! a runnable node, and owns the run loop that drains the event bus.
//!
//! Split across separate files by concern: `core` (the guarded state
//! machine), `log` (the log store), `peer` (per-peer transport threads)
//! and `replication` (pure commit-advancement helpers used by `core`).

pub mod core;
pub mod log;
pub mod peer;
pub mod replication;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use capnp;

use common::{Config, RaftError, APPEND_ENTRY_OPCODE, HEARTBEAT_OPCODE, PRE_REQUEST_VOTE_OPCODE,
             REQUEST_VOTE_OPCODE};
use event::Event;
use raft_capnp::{append_entry, append_entry_reply, heartbeat, heartbeat_reply, request_vote,
                  request_vote_reply};
use rpc::server::{RpcObject, RpcServer};
use rpc::RpcError;
use server::core::{AppendEntryArgs, Core, ElectionOutcome, HeartbeatArgs, RequestVoteArgs,
                    VoteRoundOutcome};
use server::log::Entry;
use server::peer::{PeerHandle, PeerThreadMessage};

pub use server::core::Role;

/// Bootstraps a node from its cluster `Config` and runs its event loop
/// forever. Returns only if the event bus is torn down (which in practice
/// only happens in tests -- a live node's `Sender`s never all drop).
pub fn start_server(config: Config) -> Result<(), RaftError> {
    let (tx, rx) = channel();
    let server = Server::new(&config, tx)?;
    // A fresh node starts as a Follower waiting out one randomized
    // election timeout before it ever tries to become a candidate.
    server.core.timers().restart_election_randomized();
    server.run(rx);
    Ok(())
}

struct Server {
    core: Arc<Core>,
    peers: Vec<PeerHandle>,
}

impl Server {
    fn new(config: &Config, tx: ::std::sync::mpsc::Sender<Event>) -> Result<Server, RaftError> {
        let (me_id, me_addr) = config.me;
        let peer_ids: Vec<u64> = config
            .cluster
            .keys()
            .cloned()
            .filter(|&id| id != me_id)
            .collect();
        let core = Arc::new(Core::new(me_id, peer_ids, tx.clone(), config));

        let services: Vec<(i16, Box<RpcObject>)> = vec![
            (
                PRE_REQUEST_VOTE_OPCODE,
                Box::new(PreRequestVoteHandler { core: core.clone() }) as Box<RpcObject>,
            ),
            (
                REQUEST_VOTE_OPCODE,
                Box::new(RequestVoteHandler { core: core.clone() }) as Box<RpcObject>,
            ),
            (
                HEARTBEAT_OPCODE,
                Box::new(HeartbeatHandler { core: core.clone() }) as Box<RpcObject>,
            ),
            (
                APPEND_ENTRY_OPCODE,
                Box::new(AppendEntryHandler { core: core.clone() }) as Box<RpcObject>,
            ),
        ];
        let mut rpc_server = RpcServer::new_with_services(services);
        rpc_server.bind((me_addr.ip(), me_addr.port()))?;
        rpc_server.repl()?;

        let peers: Vec<PeerHandle> = config
            .cluster
            .iter()
            .filter(|&(&id, _)| id != me_id)
            .map(|(&id, &addr): (&u64, &SocketAddr)| peer::start(id, addr, tx.clone()))
            .collect();

        Ok(Server {
            core: core,
            peers: peers,
        })
    }

    fn peer(&self, id: u64) -> Option<&PeerHandle> {
        self.peers.iter().find(|p| p.id == id)
    }

    fn run(&self, rx: Receiver<Event>) {
        for event in rx.iter() {
            match event {
                Event::ElectionTimeout => self.on_election_timeout(),
                Event::VoteTimeout => self.core.vote_timeout(),
                Event::HeartbeatTimeout => self.on_heartbeat_timeout(),
                Event::RequestVoteResponse {
                    peer_id,
                    term_at_send,
                    is_pre_vote,
                    reply,
                } => {
                    self.core.set_peer_connected(peer_id, reply.is_some());
                    self.on_vote_response(term_at_send, is_pre_vote, reply);
                }
                Event::HeartbeatResponse { peer_id, reply } => {
                    self.core.set_peer_connected(peer_id, reply.is_some());
                    if let Some(r) = reply {
                        self.core.handle_response_of_heartbeat(r);
                    }
                }
                Event::AppendEntryResponse {
                    peer_id,
                    term_at_send,
                    reply,
                } => {
                    self.core.set_peer_connected(peer_id, reply.is_some());
                    let outcome = self.core.handle_response_of_append_entry(peer_id, term_at_send, reply);
                    if outcome.redrive {
                        self.drive_replication();
                    }
                }
            }
        }
    }

    fn on_election_timeout(&self) {
        match self.core.election_timeout() {
            None => {}
            Some(ElectionOutcome::BecameLeader) => self.drive_replication(),
            Some(ElectionOutcome::StartedPreVote {
                term_for_prevote,
                last_log_index,
                last_log_term,
            }) => self.broadcast_request_vote(true, term_for_prevote, last_log_index, last_log_term),
        }
    }

    fn on_heartbeat_timeout(&self) {
        if let Some(hb) = self.core.heartbeat_timeout() {
            self.broadcast_heartbeat(hb.term, hb.commit_index, hb.me);
            // Heartbeats don't carry entries, but a quiet tick is a cheap
            // moment to retry any peer whose last append_entry was lost.
            self.drive_replication();
        }
    }

    fn on_vote_response(
        &self,
        term_at_send: u64,
        is_pre_vote: bool,
        reply: Option<core::RequestVoteReply>,
    ) {
        let outcome = self
            .core
            .handle_response_of_request_vote(term_at_send, is_pre_vote, reply);
        match outcome {
            VoteRoundOutcome::None => {}
            VoteRoundOutcome::WonPreVote {
                term_at_send,
                last_log_index,
                last_log_term,
            } => self.broadcast_request_vote(false, term_at_send, last_log_index, last_log_term),
            VoteRoundOutcome::WonVote => self.drive_replication(),
        }
    }

    fn broadcast_request_vote(
        &self,
        is_pre_vote: bool,
        term_at_send: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        let me = self.core.me();
        for peer in &self.peers {
            let args = RequestVoteArgs {
                from: me,
                term: term_at_send,
                last_log_idx: last_log_index,
                last_log_term: last_log_term,
            };
            peer.send(PeerThreadMessage::RequestVote {
                is_pre_vote: is_pre_vote,
                term_at_send: term_at_send,
                args: args,
            });
        }
    }

    fn broadcast_heartbeat(&self, term: u64, commit_index: u64, me: u64) {
        for peer in &self.peers {
            peer.send(PeerThreadMessage::Heartbeat {
                args: HeartbeatArgs {
                    from: me,
                    term: term,
                    leader_commit_index: commit_index,
                },
            });
        }
    }

    fn drive_replication(&self) {
        for (peer_id, args) in self.core.drive_replication() {
            if let Some(peer) = self.peer(peer_id) {
                peer.send(PeerThreadMessage::AppendEntries {
                    term_at_send: args.term,
                    args: args,
                });
            }
        }
    }
}

macro_rules! rpc_handler {
    ($name:ident, $request:ty, $reply:ty, $core_method:ident, $build_args:expr, $write_reply:expr) => {
        struct $name {
            core: Arc<Core>,
        }

        impl RpcObject for $name {
            fn handle_rpc(
                &self,
                params: capnp::any_pointer::Reader,
                result: capnp::any_pointer::Builder,
            ) -> Result<(), RpcError> {
                let request = params.get_as::<$request>()?;
                let args = $build_args(request);
                let reply = self.core.$core_method(&args);
                let mut builder = result.init_as::<$reply>();
                $write_reply(&mut builder, reply);
                Ok(())
            }
        }
    };
}

rpc_handler!(
    PreRequestVoteHandler,
    request_vote::Reader,
    request_vote_reply::Builder,
    pre_request_vote,
    |r: request_vote::Reader| RequestVoteArgs {
        from: r.get_from(),
        term: r.get_term(),
        last_log_idx: r.get_last_log_idx(),
        last_log_term: r.get_last_log_term(),
    },
    |b: &mut request_vote_reply::Builder, reply: core::RequestVoteReply| {
        b.set_term(reply.term);
        b.set_granted(reply.granted);
    }
);

rpc_handler!(
    RequestVoteHandler,
    request_vote::Reader,
    request_vote_reply::Builder,
    request_vote,
    |r: request_vote::Reader| RequestVoteArgs {
        from: r.get_from(),
        term: r.get_term(),
        last_log_idx: r.get_last_log_idx(),
        last_log_term: r.get_last_log_term(),
    },
    |b: &mut request_vote_reply::Builder, reply: core::RequestVoteReply| {
        b.set_term(reply.term);
        b.set_granted(reply.granted);
    }
);

rpc_handler!(
    HeartbeatHandler,
    heartbeat::Reader,
    heartbeat_reply::Builder,
    heartbeat,
    |r: heartbeat::Reader| HeartbeatArgs {
        from: r.get_from(),
        term: r.get_term(),
        leader_commit_index: r.get_leader_commit_index(),
    },
    |b: &mut heartbeat_reply::Builder, reply: core::HeartbeatReply| {
        b.set_from(reply.from);
        b.set_term(reply.term);
    }
);

struct AppendEntryHandler {
    core: Arc<Core>,
}

impl RpcObject for AppendEntryHandler {
    fn handle_rpc(
        &self,
        params: capnp::any_pointer::Reader,
        result: capnp::any_pointer::Builder,
    ) -> Result<(), RpcError> {
        let request = params.get_as::<append_entry::Reader>()?;
        let entries: Vec<Entry> = request
            .get_entries()?
            .iter()
            .map(Entry::from_proto)
            .collect();
        let args = AppendEntryArgs {
            from: request.get_from(),
            term: request.get_term(),
            prev_log_index: request.get_prev_log_index(),
            prev_log_term: request.get_prev_log_term(),
            entries: entries,
            leader_commit_index: request.get_leader_commit_index(),
        };
        let reply = self.core.append_entry(&args);
        let mut builder = result.init_as::<append_entry_reply::Builder>();
        builder.set_from(reply.from);
        builder.set_term(reply.term);
        builder.set_last_log_index(reply.last_log_index);
        builder.set_reject(reply.reject);
        builder.set_reject_hint(reply.reject_hint);
        Ok(())
    }
}
