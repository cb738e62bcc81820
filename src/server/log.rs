//! The log store: an ordered, in-memory sequence of entries
//! keyed by a monotonically increasing index, with the operations the
//! consensus core and replication driver need to detect and resolve
//! conflicts. A sentinel entry `(index=0, term=0)` is always logically
//! present so `term_at(0)` and `find_conflict` never need a special case
//! for an empty log.

use raft_capnp::entry;

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn into_proto(&self, builder: &mut entry::Builder) {
        builder.set_index(self.index);
        builder.set_term(self.term);
        builder.set_data(&self.data);
    }

    pub fn from_proto(reader: entry::Reader) -> Entry {
        Entry {
            index: reader.get_index(),
            term: reader.get_term(),
            data: reader.get_data().unwrap_or(&[]).to_vec(),
        }
    }
}

/// Contract every log implementation must satisfy. A single in-process
/// implementation (`MemoryLog`) exists; the trait exists so tests can swap
/// in hand-built logs without touching the consensus core or replication
/// driver.
pub trait Log: Send {
    /// 0 when empty (the sentinel entry is implicit, not stored).
    fn last_index(&self) -> u64;

    /// 0 for index 0. Panics if `index > last_index()`: callers are
    /// expected to only ask about indices they know exist.
    fn term_at(&self, index: u64) -> u64;

    /// First index in `entries` that either exceeds `last_index()` or has
    /// a term differing from the local entry at that index. 0 if every
    /// supplied entry already matches the local log.
    fn find_conflict(&self, entries: &[Entry]) -> u64;

    /// Truncates the log to just before `entries[0].index` if the existing
    /// entry there conflicts, then appends all of `entries`. Precondition
    /// (not checked at runtime by every caller, but enforced here): the
    /// truncation point must be strictly greater than `commit_index`.
    fn append_may_truncate(&mut self, commit_index: u64, entries: &[Entry]);

    /// Entries with index >= `next`, in order. Possibly empty.
    fn entries_from(&self, next: u64) -> Vec<Entry>;
}

#[derive(Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
}

impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog { entries: Vec::new() }
    }

    /// Index into `self.entries`, accounting for the implicit sentinel at
    /// index 0 (so `entries[0]` holds logical index 1).
    fn slot(&self, index: u64) -> Option<usize> {
        if index == 0 || index > self.last_index() {
            None
        } else {
            Some((index - 1) as usize)
        }
    }
}

impl Log for MemoryLog {
    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        assert!(
            index <= self.last_index(),
            "term_at({}) out of range (last_index={})",
            index,
            self.last_index()
        );
        self.entries[(index - 1) as usize].term
    }

    fn find_conflict(&self, entries: &[Entry]) -> u64 {
        for entry in entries {
            match self.slot(entry.index) {
                None => return entry.index,
                Some(i) => {
                    if self.entries[i].term != entry.term {
                        return entry.index;
                    }
                }
            }
        }
        0
    }

    fn append_may_truncate(&mut self, commit_index: u64, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let first_index = entries[0].index;
        debug_assert!(
            first_index > commit_index,
            "refusing to truncate at or below commit_index ({} <= {})",
            first_index,
            commit_index
        );
        if first_index <= self.last_index() {
            self.entries.truncate((first_index - 1) as usize);
        }
        self.entries.extend(entries.iter().cloned());
    }

    fn entries_from(&self, next: u64) -> Vec<Entry> {
        if next == 0 || next > self.last_index() {
            return Vec::new();
        }
        self.entries[(next - 1) as usize..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            index: index,
            term: term,
            data: vec![],
        }
    }

    #[test]
    fn empty_log_reports_sentinel() {
        let log = MemoryLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0), 0);
    }

    #[test]
    fn append_extends_log() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1), entry(2, 1)]);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), 1);
    }

    #[test]
    fn find_conflict_detects_term_mismatch() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1), entry(2, 1), entry(3, 2)]);
        let incoming = [entry(3, 4), entry(4, 4)];
        assert_eq!(log.find_conflict(&incoming), 3);
    }

    #[test]
    fn find_conflict_returns_zero_when_all_match() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1), entry(2, 1)]);
        let incoming = [entry(1, 1), entry(2, 1)];
        assert_eq!(log.find_conflict(&incoming), 0);
    }

    #[test]
    fn find_conflict_detects_entries_past_last_index() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1)]);
        let incoming = [entry(1, 1), entry(2, 5)];
        assert_eq!(log.find_conflict(&incoming), 2);
    }

    #[test]
    fn conflict_truncation_replaces_suffix() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1), entry(2, 1), entry(3, 2)]);
        let conflict = log.find_conflict(&[entry(3, 4), entry(4, 4)]);
        assert_eq!(conflict, 3);
        log.append_may_truncate(1, &[entry(3, 4), entry(4, 4)]);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term_at(3), 4);
        assert_eq!(log.term_at(1), 1);
        assert_eq!(log.term_at(2), 1);
    }

    #[test]
    fn entries_from_returns_suffix() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1), entry(2, 1), entry(3, 1)]);
        let suffix = log.entries_from(2);
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0].index, 2);
    }

    #[test]
    fn entries_from_empty_when_next_beyond_last() {
        let mut log = MemoryLog::new();
        log.append_may_truncate(0, &[entry(1, 1)]);
        assert!(log.entries_from(5).is_empty());
    }
}
