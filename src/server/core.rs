//! The consensus core: role, term, vote, leader identity,
//! commit index, and per-peer replication progress, all guarded by one
//! mutex (`state`), plus the in-memory log and the timer service the core
//! drives directly. `Core` knows nothing about sockets or peer addresses
//! -- broadcasting and per-peer dispatch are `server::Server`'s job, which
//! wraps this in the transport glue. Handlers here return small "outcome"
//! values describing what, if anything, the caller needs to broadcast;
//! this keeps every state transition reachable without the core ever
//! calling back out into the transport while holding its own lock.

use std::cmp;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use common::Config;
use event::Event;
use server::log::{Entry, Log, MemoryLog};
use server::replication;
use timer::TimerService;

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Clone, Debug)]
pub struct RequestVoteArgs {
    pub from: u64,
    pub term: u64,
    pub last_log_idx: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestVoteReply {
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug)]
pub struct HeartbeatArgs {
    pub from: u64,
    pub term: u64,
    pub leader_commit_index: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatReply {
    pub from: u64,
    pub term: u64,
}

#[derive(Clone, Debug)]
pub struct AppendEntryArgs {
    pub from: u64,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit_index: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntryReply {
    pub from: u64,
    pub term: u64,
    pub last_log_index: u64,
    pub reject: bool,
    pub reject_hint: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PeerProgress {
    pub next_index: u64,
    pub match_index: u64,
    pub paused: bool,
}

/// What `election_timeout` set in motion, for `Server` to broadcast.
pub enum ElectionOutcome {
    /// Single-node cluster: became Leader without a pre-vote round at all.
    BecameLeader,
    StartedPreVote {
        term_for_prevote: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
}

/// What a vote/pre-vote response tipped the count into, for `Server` to
/// broadcast the next round (or nothing, for a stale/losing response).
pub enum VoteRoundOutcome {
    None,
    WonPreVote {
        term_at_send: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    WonVote,
}

pub struct HeartbeatBroadcast {
    pub term: u64,
    pub commit_index: u64,
    pub me: u64,
}

pub struct AppendOutcome {
    /// True when there may be more log to push to this peer (it accepted
    /// or rejected with a hint) and the driver should try again.
    pub redrive: bool,
}

struct State {
    role: Role,
    current_term: u64,
    vote_for: Option<u64>,
    leader_id: Option<u64>,
    commit_index: u64,
    election_timeout_flag: bool,
    vote_round_is_pre_vote: bool,
    /// The term a pre-vote/vote response is expected to be tagged with.
    /// Equal to `current_term` during a real vote round, but during a
    /// pre-vote round `current_term` is deliberately left unmoved (per spec
    /// §4.1, pre-vote "does NOT change current_term"), so responses can't
    /// be matched against it directly -- this field tracks the prospective
    /// term the pre-vote was sent for instead.
    vote_round_term: u64,
    vote_count: u32,
    connected: HashSet<u64>,
    progress: HashMap<u64, PeerProgress>,
}

pub struct Core {
    state: Mutex<State>,
    log: Mutex<MemoryLog>,
    timers: TimerService,
    me: u64,
    peer_ids: Vec<u64>,
    peers_num: usize,
}

impl Core {
    pub fn new(me: u64, peer_ids: Vec<u64>, tx: Sender<Event>, config: &Config) -> Core {
        let peers_num = peer_ids.len();
        Core {
            state: Mutex::new(State {
                role: Role::Follower,
                current_term: 0,
                vote_for: None,
                leader_id: None,
                commit_index: 0,
                election_timeout_flag: false,
                vote_round_is_pre_vote: false,
                vote_round_term: 0,
                vote_count: 0,
                connected: HashSet::new(),
                progress: HashMap::new(),
            }),
            log: Mutex::new(MemoryLog::new()),
            timers: TimerService::new(tx, config),
            me: me,
            peer_ids: peer_ids,
            peers_num: peers_num,
        }
    }

    pub fn me(&self) -> u64 {
        self.me
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().unwrap().current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().unwrap().commit_index
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.state.lock().unwrap().leader_id
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn set_peer_connected(&self, id: u64, connected: bool) {
        let mut state = self.state.lock().unwrap();
        if connected {
            state.connected.insert(id);
        } else {
            state.connected.remove(&id);
        }
    }

    fn majority(&self, count: usize) -> bool {
        count > (self.peers_num + 1) / 2
    }

    /// A Leader is healthy with a connected majority; a Follower is
    /// healthy with a known leader and no election timeout pending; a
    /// Candidate is never healthy.
    fn check_state(&self, state: &State) -> bool {
        match state.role {
            Role::Leader => self.majority(state.connected.len() + 1),
            Role::Follower => state.leader_id.is_some() && !state.election_timeout_flag,
            Role::Candidate => false,
        }
    }

    pub fn pre_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let state = self.state.lock().unwrap();
        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                granted: false,
            };
        }
        if self.check_state(&state) {
            return RequestVoteReply {
                term: state.current_term,
                granted: false,
            };
        }
        let log = self.log.lock().unwrap();
        let last_index = log.last_index();
        let last_term = log.term_at(last_index);
        let log_ok = args.last_log_term > last_term
            || (args.last_log_term == last_term && args.last_log_idx >= last_index);
        RequestVoteReply {
            term: state.current_term,
            granted: log_ok,
        }
    }

    pub fn request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().unwrap();
        let mut granted = false;
        if args.term >= state.current_term {
            if args.term > state.current_term {
                if self.check_state(&state) {
                    return RequestVoteReply {
                        term: state.current_term,
                        granted: false,
                    };
                }
                self.do_step_down(&mut state, args.term);
            }
            let voted_for_someone_else = match state.vote_for {
                Some(voted) => voted != args.from,
                None => false,
            };
            if args.term != 0 && !voted_for_someone_else {
                let log_ok = {
                    let log = self.log.lock().unwrap();
                    let last_index = log.last_index();
                    let last_term = log.term_at(last_index);
                    args.last_log_term > last_term
                        || (args.last_log_term == last_term && args.last_log_idx >= last_index)
                };
                if log_ok {
                    state.vote_for = Some(args.from);
                    granted = true;
                    // Always reset the election timer on a grant, even if
                    // do_step_down already ran above for the term bump.
                    self.do_step_down(&mut state, args.term);
                }
            }
        }
        RequestVoteReply {
            term: state.current_term,
            granted: granted,
        }
    }

    pub fn heartbeat(&self, args: &HeartbeatArgs) -> HeartbeatReply {
        let mut state = self.state.lock().unwrap();
        if args.term < state.current_term {
            return HeartbeatReply {
                from: self.me,
                term: state.current_term,
            };
        }
        self.do_step_down(&mut state, args.term);
        state.leader_id = Some(args.from);
        let last_index = self.log.lock().unwrap().last_index();
        state.commit_index = cmp::min(args.leader_commit_index, last_index);
        HeartbeatReply {
            from: self.me,
            term: state.current_term,
        }
    }

    pub fn handle_response_of_heartbeat(&self, reply: HeartbeatReply) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            self.do_step_down(&mut state, reply.term);
        }
    }

    pub fn append_entry(&self, args: &AppendEntryArgs) -> AppendEntryReply {
        let mut state = self.state.lock().unwrap();
        if args.term > state.current_term {
            self.do_step_down(&mut state, args.term);
            state.leader_id = Some(args.from);
        }
        let mut reply = AppendEntryReply {
            from: self.me,
            term: state.current_term,
            last_log_index: 0,
            reject: false,
            reject_hint: 0,
        };
        if args.prev_log_index < state.commit_index {
            // Already-committed prefix: idempotent no-op -- the leader
            // already knows it committed this, so this path must not be
            // used to advance commit_index here.
            reply.last_log_index = state.commit_index;
            return reply;
        }
        let mut log = self.log.lock().unwrap();
        if log.term_at(args.prev_log_index) != args.prev_log_term {
            reply.reject_hint = log.last_index();
            return reply;
        }
        let conflict_index = log.find_conflict(&args.entries);
        if conflict_index == 0 {
            reply.reject = true;
            reply.reject_hint = log.last_index();
            return reply;
        }
        debug_assert!(
            conflict_index > state.commit_index,
            "append_entry would truncate at or below commit_index"
        );
        let suffix: Vec<Entry> = args
            .entries
            .iter()
            .filter(|e| e.index >= conflict_index)
            .cloned()
            .collect();
        log.append_may_truncate(state.commit_index, &suffix);
        state.commit_index = cmp::min(args.leader_commit_index, log.last_index());
        reply.last_log_index = log.last_index();
        reply.reject = false;
        reply
    }

    /// Shared by request_vote/heartbeat/append_entry: cancels whatever
    /// timer the outgoing role owned, adopts the new term if higher, and
    /// restarts the election timer with a randomized duration. Caller
    /// already holds `state`.
    fn do_step_down(&self, state: &mut State, term: u64) {
        match state.role {
            Role::Candidate => self.timers.cancel_vote(),
            Role::Leader => self.timers.cancel_heartbeat(),
            Role::Follower => {}
        }
        if term > state.current_term {
            state.vote_for = None;
            state.current_term = term;
        }
        state.role = Role::Follower;
        state.leader_id = None;
        // Spec §3 "Election flag"/§4.4: cleared on restart. This is the
        // common path for every legitimate return to a normal waiting
        // Follower (heartbeat accepted, vote granted, higher-term step
        // down) -- as opposed to `election_timeout`'s own re-arm of the
        // timer mid-pre-vote-round, which deliberately leaves the flag set.
        state.election_timeout_flag = false;
        self.timers.restart_election_randomized();
    }

    pub fn step_down_follower(&self, term: u64) {
        let mut state = self.state.lock().unwrap();
        self.do_step_down(&mut state, term);
    }

    pub fn election_timeout(&self) -> Option<ElectionOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Follower {
            return None; // stale fire from a timer we've since moved past
        }
        state.election_timeout_flag = true;
        if self.peers_num == 0 {
            drop(state);
            self.enter_candidate();
            return Some(ElectionOutcome::BecameLeader);
        }
        state.leader_id = None;
        let term_for_prevote = state.current_term + 1;
        state.vote_round_is_pre_vote = true;
        state.vote_round_term = term_for_prevote;
        state.vote_count = 1;
        drop(state);
        self.timers.restart_election_base();
        let log = self.log.lock().unwrap();
        let last_log_index = log.last_index();
        let last_log_term = log.term_at(last_log_index);
        Some(ElectionOutcome::StartedPreVote {
            term_for_prevote: term_for_prevote,
            last_log_index: last_log_index,
            last_log_term: last_log_term,
        })
    }

    pub fn vote_timeout(&self) {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Candidate {
            return;
        }
        let term = state.current_term;
        self.do_step_down(&mut state, term);
    }

    pub fn heartbeat_timeout(&self) -> Option<HeartbeatBroadcast> {
        let state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return None;
        }
        let broadcast = HeartbeatBroadcast {
            term: state.current_term,
            commit_index: state.commit_index,
            me: self.me,
        };
        drop(state);
        self.timers.restart_heartbeat();
        Some(broadcast)
    }

    /// The pure-state half of "become candidate" once a pre-vote majority
    /// is reached: bumps the term, votes for self, starts the vote timer,
    /// and -- since a single-vote majority can already be reached here in
    /// a peerless cluster -- may immediately become Leader too.
    fn enter_candidate(&self) -> u64 {
        let term_at_send = {
            let mut state = self.state.lock().unwrap();
            self.timers.cancel_election();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.vote_for = Some(self.me);
            state.leader_id = None;
            state.vote_round_is_pre_vote = false;
            state.vote_round_term = state.current_term;
            state.vote_count = 1;
            state.current_term
        };
        self.timers.restart_vote();
        if self.majority(1) {
            self.become_leader();
        }
        term_at_send
    }

    fn become_leader(&self) {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Candidate {
            return;
        }
        self.timers.cancel_vote();
        state.role = Role::Leader;
        state.leader_id = Some(self.me);
        let last_index = self.log.lock().unwrap().last_index();
        state.progress.clear();
        for id in &self.peer_ids {
            state.progress.insert(
                *id,
                PeerProgress {
                    next_index: last_index + 1,
                    match_index: 0,
                    paused: false,
                },
            );
        }
        drop(state);
        self.timers.restart_heartbeat();
        info!("node {} became leader", self.me);
    }

    pub fn handle_response_of_request_vote(
        &self,
        term_at_send: u64,
        is_pre_vote: bool,
        reply: Option<RequestVoteReply>,
    ) -> VoteRoundOutcome {
        let reply = match reply {
            Some(r) => r,
            // Transport failure: no per-RPC retry, the election timer
            // governs retry of the whole round.
            None => return VoteRoundOutcome::None,
        };
        let mut state = self.state.lock().unwrap();
        let expected_role = if is_pre_vote {
            Role::Follower
        } else {
            Role::Candidate
        };
        if state.role != expected_role {
            return VoteRoundOutcome::None;
        }
        if state.vote_round_term != term_at_send || state.vote_round_is_pre_vote != is_pre_vote {
            return VoteRoundOutcome::None; // stale response from an earlier or abandoned round
        }
        if reply.term > state.current_term {
            self.do_step_down(&mut state, reply.term);
            return VoteRoundOutcome::None;
        }
        if reply.granted {
            state.vote_count += 1;
        }
        if !self.majority(state.vote_count as usize) {
            return VoteRoundOutcome::None;
        }
        if is_pre_vote {
            drop(state);
            let won_term = self.enter_candidate();
            let log = self.log.lock().unwrap();
            let last_log_index = log.last_index();
            let last_log_term = log.term_at(last_log_index);
            VoteRoundOutcome::WonPreVote {
                term_at_send: won_term,
                last_log_index: last_log_index,
                last_log_term: last_log_term,
            }
        } else {
            drop(state);
            self.become_leader();
            VoteRoundOutcome::WonVote
        }
    }

    /// The replication driver's per-peer dispatch: for every follower not
    /// paused and not yet caught up, builds the append_entry args to send
    /// and marks it paused until a response arrives.
    pub fn drive_replication(&self) -> Vec<(u64, AppendEntryArgs)> {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return Vec::new();
        }
        let log = self.log.lock().unwrap();
        let last_index = log.last_index();
        let current_term = state.current_term;
        let leader_commit = state.commit_index;
        let me = self.me;
        let mut out = Vec::new();
        for (peer_id, progress) in state.progress.iter_mut() {
            if progress.paused || progress.match_index >= last_index {
                continue;
            }
            let prev_log_index = progress.match_index;
            let prev_log_term = log.term_at(prev_log_index);
            let entries = log.entries_from(progress.next_index);
            if entries.is_empty() {
                // Nothing at or beyond next_index yet (mirrors the
                // original's send_entries early-return) -- a reject
                // response is what rewinds next_index so this becomes
                // non-empty on a later pass.
                continue;
            }
            progress.paused = true;
            out.push((
                *peer_id,
                AppendEntryArgs {
                    from: me,
                    term: current_term,
                    prev_log_index: prev_log_index,
                    prev_log_term: prev_log_term,
                    entries: entries,
                    leader_commit_index: leader_commit,
                },
            ));
        }
        out
    }

    pub fn handle_response_of_append_entry(
        &self,
        peer_id: u64,
        term_at_send: u64,
        reply: Option<AppendEntryReply>,
    ) -> AppendOutcome {
        let mut state = self.state.lock().unwrap();
        if state.current_term != term_at_send {
            return AppendOutcome { redrive: false };
        }
        let reply = match reply {
            None => {
                // Transport error/timeout: just clear paused and let the
                // next trigger retry; don't touch next/match.
                if let Some(p) = state.progress.get_mut(&peer_id) {
                    p.paused = false;
                }
                return AppendOutcome { redrive: false };
            }
            Some(r) => r,
        };
        if reply.term > state.current_term {
            self.do_step_down(&mut state, reply.term);
            return AppendOutcome { redrive: false };
        }
        if let Some(p) = state.progress.get_mut(&peer_id) {
            if reply.reject {
                p.match_index = cmp::max(p.match_index, reply.reject_hint);
                // Rewind, don't just ratchet up: next_index was set
                // optimistically (last_index+1 on become_leader) and a
                // reject's hint is the follower's real last_index, which
                // can be well below that guess. Pinning next_index to
                // max() here would leave it stuck past the end of the
                // log forever, so entries_from(next_index) never finds
                // the entries this follower is actually missing.
                p.next_index = reply.reject_hint + 1;
            } else {
                p.match_index = cmp::max(p.match_index, reply.last_log_index);
                p.next_index = cmp::max(p.next_index, reply.last_log_index + 1);
            }
            p.paused = false;
        }
        if !reply.reject {
            self.advance_commit(&mut state);
        }
        AppendOutcome { redrive: true }
    }

    /// Takes the lower median of follower match indices and commits it,
    /// but only if that entry was appended in the *current* term --
    /// committing a prior-term entry via replication count alone is unsafe
    /// (a later leader could still overwrite it), so this check is
    /// required even though a naive median-and-commit would pass most
    /// tests without it.
    fn advance_commit(&self, state: &mut State) {
        let candidate = replication::median_match_index(&state.progress);
        if candidate <= state.commit_index {
            return;
        }
        let log = self.log.lock().unwrap();
        if log.term_at(candidate) == state.current_term {
            state.commit_index = candidate;
            info!("commit index advanced to {}", candidate);
        }
    }

    #[cfg(test)]
    pub fn seed_log(&self, entries: &[Entry]) {
        let mut log = self.log.lock().unwrap();
        log.append_may_truncate(0, entries);
    }

    #[cfg(test)]
    pub fn set_commit_index_for_test(&self, idx: u64) {
        self.state.lock().unwrap().commit_index = idx;
    }

    #[cfg(test)]
    pub fn vote_for_test(&self) -> Option<u64> {
        self.state.lock().unwrap().vote_for
    }

    #[cfg(test)]
    pub fn election_timeout_flag_for_test(&self) -> bool {
        self.state.lock().unwrap().election_timeout_flag
    }

    /// Test-only: overwrites `current_term` and seeds per-peer `match`
    /// (leaving `next = match + 1`, unpaused) without going through a real
    /// election, so replication/commit behavior can be tested against a
    /// hand-built log and progress table directly.
    #[cfg(test)]
    pub fn force_term_and_progress_for_test(&self, term: u64, matches: &[(u64, u64)]) {
        let mut state = self.state.lock().unwrap();
        state.current_term = term;
        for &(peer_id, match_index) in matches {
            state.progress.insert(
                peer_id,
                PeerProgress {
                    next_index: match_index + 1,
                    match_index: match_index,
                    paused: false,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn test_core(me: u64, peer_ids: Vec<u64>) -> Core {
        let (tx, _rx) = channel();
        Core::new(me, peer_ids, tx, &Config::new(Default::default(), me, "127.0.0.1:0".parse().unwrap()))
    }

    #[test]
    fn single_node_cluster_becomes_leader_on_election_timeout() {
        let core = test_core(0, vec![]);
        match core.election_timeout() {
            Some(ElectionOutcome::BecameLeader) => {}
            _ => panic!("expected single-node cluster to become leader"),
        }
        assert_eq!(core.role(), Role::Leader);
        assert_eq!(core.current_term(), 1);
        assert_eq!(core.commit_index(), 0);
    }

    #[test]
    fn election_timeout_with_peers_starts_pre_vote_without_bumping_term() {
        let core = test_core(0, vec![1, 2]);
        match core.election_timeout() {
            Some(ElectionOutcome::StartedPreVote { term_for_prevote, .. }) => {
                assert_eq!(term_for_prevote, 1);
            }
            _ => panic!("expected a pre-vote round"),
        }
        assert_eq!(core.current_term(), 0, "pre-vote must not bump current_term");
        assert_eq!(core.role(), Role::Follower);
    }

    #[test]
    fn pre_vote_majority_then_vote_majority_becomes_leader() {
        let core = test_core(0, vec![1, 2]);
        core.election_timeout();
        let outcome = core.handle_response_of_request_vote(
            1,
            true,
            Some(RequestVoteReply { term: 1, granted: true }),
        );
        let term_at_send = match outcome {
            VoteRoundOutcome::WonPreVote { term_at_send, .. } => term_at_send,
            _ => panic!("expected pre-vote to win with one grant out of two peers"),
        };
        assert_eq!(core.role(), Role::Candidate);
        assert_eq!(core.current_term(), 1);

        let outcome = core.handle_response_of_request_vote(
            term_at_send,
            false,
            Some(RequestVoteReply { term: term_at_send, granted: true }),
        );
        assert!(matches!(outcome, VoteRoundOutcome::WonVote));
        assert_eq!(core.role(), Role::Leader);
        assert_eq!(core.leader_id(), Some(0));
    }

    #[test]
    fn stale_vote_response_is_ignored() {
        let core = test_core(0, vec![1, 2]);
        core.election_timeout();
        // A response for a term we've already moved past is ignored.
        let outcome = core.handle_response_of_request_vote(
            99,
            true,
            Some(RequestVoteReply { term: 1, granted: true }),
        );
        assert!(matches!(outcome, VoteRoundOutcome::None));
        assert_eq!(core.role(), Role::Follower);
    }

    #[test]
    fn request_vote_denies_stale_term() {
        let core = test_core(0, vec![1, 2]);
        core.step_down_follower(5);
        let reply = core.request_vote(&RequestVoteArgs {
            from: 1,
            term: 3,
            last_log_idx: 0,
            last_log_term: 0,
        });
        assert!(!reply.granted);
        assert_eq!(reply.term, 5);
    }

    #[test]
    fn request_vote_grants_once_per_term() {
        let core = test_core(0, vec![1, 2]);
        let args = RequestVoteArgs {
            from: 1,
            term: 1,
            last_log_idx: 0,
            last_log_term: 0,
        };
        let first = core.request_vote(&args);
        assert!(first.granted);
        assert_eq!(core.vote_for_test(), Some(1));

        let from_other = RequestVoteArgs {
            from: 2,
            ..args.clone()
        };
        let second = core.request_vote(&from_other);
        assert!(!second.granted, "a second candidate in the same term must be denied");

        // A repeat from the same requester in the same term is idempotent.
        let repeat = core.request_vote(&args);
        assert!(repeat.granted);
    }

    #[test]
    fn heartbeat_from_higher_term_steps_down_stale_leader() {
        let core = test_core(0, vec![1, 2]);
        core.election_timeout();
        core.handle_response_of_request_vote(1, true, Some(RequestVoteReply { term: 1, granted: true }));
        core.handle_response_of_request_vote(1, false, Some(RequestVoteReply { term: 1, granted: true }));
        assert_eq!(core.role(), Role::Leader);

        let reply = core.heartbeat(&HeartbeatArgs {
            from: 9,
            term: 7,
            leader_commit_index: 0,
        });
        assert_eq!(reply.term, 7);
        assert_eq!(core.role(), Role::Follower);
        assert_eq!(core.current_term(), 7);
        assert_eq!(core.leader_id(), Some(9));
        assert_eq!(core.vote_for_test(), None);
    }

    #[test]
    fn election_timeout_flag_set_on_fire_and_cleared_on_heartbeat() {
        let core = test_core(0, vec![1, 2]);
        assert!(!core.election_timeout_flag_for_test());
        core.election_timeout();
        assert!(
            core.election_timeout_flag_for_test(),
            "a fired election timeout must mark this follower unhealthy"
        );
        core.heartbeat(&HeartbeatArgs {
            from: 1,
            term: 1,
            leader_commit_index: 0,
        });
        assert!(
            !core.election_timeout_flag_for_test(),
            "accepting a heartbeat from a live leader clears the flag"
        );
    }

    #[test]
    fn append_entry_conflict_truncation() {
        let core = test_core(1, vec![0, 2]);
        core.seed_log(&[
            Entry { index: 1, term: 1, data: vec![] },
            Entry { index: 2, term: 1, data: vec![] },
            Entry { index: 3, term: 2, data: vec![] },
        ]);
        core.step_down_follower(4);
        let reply = core.append_entry(&AppendEntryArgs {
            from: 0,
            term: 4,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![
                Entry { index: 3, term: 4, data: vec![] },
                Entry { index: 4, term: 4, data: vec![] },
            ],
            leader_commit_index: 2,
        });
        assert!(!reply.reject);
        assert_eq!(reply.last_log_index, 4);
    }

    #[test]
    fn append_entry_rejects_on_term_mismatch_at_prev_index() {
        let core = test_core(1, vec![0, 2]);
        core.seed_log(&[Entry { index: 1, term: 1, data: vec![] }]);
        let reply = core.append_entry(&AppendEntryArgs {
            from: 0,
            term: 1,
            prev_log_index: 1,
            prev_log_term: 99,
            entries: vec![],
            leader_commit_index: 0,
        });
        assert!(!reply.reject);
        assert_eq!(reply.reject_hint, 1);
    }

    #[test]
    fn append_entry_below_commit_index_is_idempotent() {
        let core = test_core(1, vec![0, 2]);
        core.seed_log(&[Entry { index: 1, term: 1, data: vec![] }]);
        core.set_commit_index_for_test(1);
        let reply = core.append_entry(&AppendEntryArgs {
            from: 0,
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit_index: 1,
        });
        assert!(!reply.reject);
        assert_eq!(reply.last_log_index, 1);
    }

    #[test]
    fn replication_and_commit_advance() {
        // Drive the single-node path to leadership at term 1, then hand-seed
        // a term-3 log and peer progress to exercise drive_replication and
        // advance_commit directly.
        let core = test_core(0, vec![1, 2]);
        core.seed_log(&[
            Entry { index: 1, term: 3, data: vec![] },
            Entry { index: 2, term: 3, data: vec![] },
            Entry { index: 3, term: 3, data: vec![] },
        ]);
        core.election_timeout();
        core.handle_response_of_request_vote(1, true, Some(RequestVoteReply { term: 1, granted: true }));
        core.handle_response_of_request_vote(1, false, Some(RequestVoteReply { term: 1, granted: true }));
        assert_eq!(core.role(), Role::Leader);
        core.force_term_and_progress_for_test(3, &[(1, 2), (2, 2)]);

        let batches = core.drive_replication();
        assert_eq!(batches.len(), 2, "both followers are behind last_index and should be driven");
        for (_, args) in &batches {
            assert_eq!(args.prev_log_index, 2);
            assert_eq!(args.entries.len(), 1);
            assert_eq!(args.entries[0].index, 3);
        }

        let outcome = core.handle_response_of_append_entry(
            1,
            3,
            Some(AppendEntryReply {
                from: 1,
                term: 3,
                last_log_index: 3,
                reject: false,
                reject_hint: 0,
            }),
        );
        assert!(outcome.redrive);
        assert_eq!(core.commit_index(), 0, "only one of two followers has matched index 3 so far");

        core.handle_response_of_append_entry(
            2,
            3,
            Some(AppendEntryReply {
                from: 2,
                term: 3,
                last_log_index: 3,
                reject: false,
                reject_hint: 0,
            }),
        );
        assert_eq!(core.commit_index(), 3, "median match index of [3, 3] commits index 3");
    }

    #[test]
    fn append_entry_reject_advances_match_via_hint() {
        // On reject=true, match advances via max(current, reject_hint) --
        // the hint only ever tells the leader about entries the follower
        // already has, so it can't regress -- but next_index is rewound to
        // reject_hint+1 outright, since the optimistic guess it held
        // before (last_index+1 from become_leader) can be arbitrarily far
        // past where this follower actually is.
        let core = test_core(0, vec![1]);
        core.seed_log(&[
            Entry { index: 1, term: 1, data: vec![] },
            Entry { index: 2, term: 1, data: vec![] },
        ]);
        core.election_timeout();
        core.handle_response_of_request_vote(1, true, Some(RequestVoteReply { term: 1, granted: true }));
        core.handle_response_of_request_vote(1, false, Some(RequestVoteReply { term: 1, granted: true }));
        assert_eq!(core.role(), Role::Leader);

        let outcome = core.handle_response_of_append_entry(
            1,
            1,
            Some(AppendEntryReply {
                from: 1,
                term: 1,
                last_log_index: 0,
                reject: true,
                reject_hint: 2,
            }),
        );
        assert!(outcome.redrive);
        assert_eq!(core.commit_index(), 0, "reject never advances commit_index directly");
        let batches = core.drive_replication();
        assert!(batches.is_empty(), "match now equals last_index, nothing left to send");
    }

    #[test]
    fn drive_replication_skips_a_peer_with_nothing_to_send() {
        // A fresh leader's next_index starts at last_index+1, one past the
        // end of its own log -- entries_from(next_index) is empty until
        // either new entries are appended past that point or a reject
        // rewinds next_index back into range. Until then drive_replication
        // must not dispatch a no-op append for that peer.
        let core = test_core(0, vec![1, 2]);
        core.seed_log(&[Entry { index: 1, term: 1, data: vec![] }]);
        core.election_timeout();
        core.handle_response_of_request_vote(1, true, Some(RequestVoteReply { term: 1, granted: true }));
        core.handle_response_of_request_vote(1, false, Some(RequestVoteReply { term: 1, granted: true }));
        assert_eq!(core.role(), Role::Leader);

        assert!(
            core.drive_replication().is_empty(),
            "next_index already points past the only entry in the log"
        );
    }

    #[test]
    fn append_entry_reject_rewinds_next_index_below_prior_high_water_mark() {
        // A follower far enough behind rejects with a hint well under
        // next_index's optimistic starting guess. next_index must rewind
        // (not just ratchet up) so the following drive_replication pass
        // finds real entries to send instead of looping on an empty batch.
        let core = test_core(0, vec![1]);
        core.seed_log(&[
            Entry { index: 1, term: 1, data: vec![] },
            Entry { index: 2, term: 1, data: vec![] },
            Entry { index: 3, term: 1, data: vec![] },
            Entry { index: 4, term: 1, data: vec![] },
            Entry { index: 5, term: 1, data: vec![] },
        ]);
        core.election_timeout();
        core.handle_response_of_request_vote(1, true, Some(RequestVoteReply { term: 1, granted: true }));
        core.handle_response_of_request_vote(1, false, Some(RequestVoteReply { term: 1, granted: true }));
        assert_eq!(core.role(), Role::Leader);

        // next_index started at 6 (last_index+1); this follower only has
        // up to index 2.
        assert!(core.drive_replication().is_empty());
        let outcome = core.handle_response_of_append_entry(
            1,
            1,
            Some(AppendEntryReply {
                from: 1,
                term: 1,
                last_log_index: 0,
                reject: true,
                reject_hint: 2,
            }),
        );
        assert!(outcome.redrive);

        let batches = core.drive_replication();
        assert_eq!(batches.len(), 1, "the rewound next_index should now have real entries to ship");
        let (_, args) = &batches[0];
        assert_eq!(args.prev_log_index, 2, "prev_log_index tracks match_index, confirmed at 2 by the hint");
        assert_eq!(args.entries.len(), 3, "entries 3, 4 and 5 are now within [next_index, last_index]");
        assert_eq!(args.entries[0].index, 3);
    }
}
