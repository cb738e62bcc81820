//! The event bus: every core input that isn't a synchronous RPC reply
//! arrives as one of these variants over an `mpsc` channel owned by the
//! consensus core's run loop. Timer fires and peer threads each hold a
//! clone of the `Sender` half; the run loop is the sole `Receiver`.

use server::core::{AppendEntryReply, HeartbeatReply, RequestVoteReply};

#[derive(Debug)]
pub enum Event {
    ElectionTimeout,
    VoteTimeout,
    HeartbeatTimeout,
    RequestVoteResponse {
        peer_id: u64,
        term_at_send: u64,
        is_pre_vote: bool,
        reply: Option<RequestVoteReply>,
    },
    HeartbeatResponse {
        peer_id: u64,
        reply: Option<HeartbeatReply>,
    },
    AppendEntryResponse {
        peer_id: u64,
        term_at_send: u64,
        reply: Option<AppendEntryReply>,
    },
}
