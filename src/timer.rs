//! The timer service: three independent one-shot timers
//! (election, vote, heartbeat) that fire `Event`s into the consensus core's
//! run loop. `restart` is idempotent -- it cancels any pending fire for that
//! timer and schedules a new one -- implemented with a generation counter
//! rather than an actual cancelable handle, so a fire already in flight
//! when a restart/cancel happens is simply dropped when it wakes up and
//! notices its generation is stale.

use rand;
use rand::distributions::{IndependentSample, Range};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::Config;
use event::Event;

/// A single one-shot timer slot. Cloning the generation counter (not the
/// timer itself) into the sleeping thread is what makes restart/cancel
/// race-free: the thread that wakes up after a stale restart will see a
/// generation that has moved on and simply not send anything.
struct Timer {
    generation: Arc<AtomicUsize>,
    tx: Sender<Event>,
    event: fn() -> Event,
}

impl Timer {
    fn new(tx: Sender<Event>, event: fn() -> Event) -> Timer {
        Timer {
            generation: Arc::new(AtomicUsize::new(0)),
            tx: tx,
            event: event,
        }
    }

    fn restart(&self, duration: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation_ref = self.generation.clone();
        let tx = self.tx.clone();
        let event = self.event;
        thread::spawn(move || {
            thread::sleep(duration);
            if generation_ref.load(Ordering::SeqCst) == generation {
                // Ignore send errors: the run loop has shut down.
                let _ = tx.send(event());
            }
        });
    }

    fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TimerService {
    election: Timer,
    vote: Timer,
    heartbeat: Timer,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    vote_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl TimerService {
    pub fn new(tx: Sender<Event>, config: &Config) -> TimerService {
        TimerService {
            election: Timer::new(tx.clone(), || Event::ElectionTimeout),
            vote: Timer::new(tx.clone(), || Event::VoteTimeout),
            heartbeat: Timer::new(tx, || Event::HeartbeatTimeout),
            election_timeout_min: config.election_timeout_min,
            election_timeout_max: config.election_timeout_max,
            vote_timeout: config.vote_timeout,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    /// Used for a fresh pre-vote round: fixed base duration, not
    /// randomized.
    pub fn restart_election_base(&self) {
        self.election.restart(self.election_timeout_min);
    }

    /// Used on step-down: randomized into `[base, 2*base)` to avoid
    /// synchronized elections across the cluster.
    pub fn restart_election_randomized(&self) {
        self.election.restart(self.random_election_timeout());
    }

    pub fn cancel_election(&self) {
        self.election.cancel();
    }

    pub fn restart_vote(&self) {
        self.vote.restart(self.vote_timeout);
    }

    pub fn cancel_vote(&self) {
        self.vote.cancel();
    }

    pub fn restart_heartbeat(&self) {
        self.heartbeat.restart(self.heartbeat_timeout);
    }

    pub fn cancel_heartbeat(&self) {
        self.heartbeat.cancel();
    }

    fn random_election_timeout(&self) -> Duration {
        let min_ms = duration_to_millis(self.election_timeout_min);
        let max_ms = duration_to_millis(self.election_timeout_max);
        let between = Range::new(min_ms, max_ms);
        let mut rng = rand::thread_rng();
        Duration::from_millis(between.ind_sample(&mut rng))
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    d.as_secs() * 1000 + (d.subsec_nanos() / 1_000_000) as u64
}
