//! Pure helpers for the replication driver that don't need the
//! core's lock held to compute -- kept separate from `server::core` so the
//! commit-advancement rule can be unit-tested against bare progress maps.

use std::collections::HashMap;

use server::core::PeerProgress;

/// Majority-quorum commit advancement: the lower median of all followers'
/// `match` indices is the highest index known replicated to a majority
/// (the leader itself is the implicit extra vote in "more than half of
/// all nodes").
pub fn median_match_index(progress: &HashMap<u64, PeerProgress>) -> u64 {
    if progress.is_empty() {
        return 0;
    }
    let mut matches: Vec<u64> = progress.values().map(|p| p.match_index).collect();
    matches.sort();
    matches[(matches.len() - 1) / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(matches: &[u64]) -> HashMap<u64, PeerProgress> {
        matches
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                (
                    i as u64,
                    PeerProgress {
                        next_index: m + 1,
                        match_index: m,
                        paused: false,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn median_of_three_followers() {
        let p = progress(&[3, 3, 1]);
        assert_eq!(median_match_index(&p), 3);
    }

    #[test]
    fn median_of_two_followers_takes_lower() {
        let p = progress(&[5, 2]);
        assert_eq!(median_match_index(&p), 2);
    }

    #[test]
    fn median_of_four_followers_takes_lower_of_middle_pair() {
        let p = progress(&[1, 2, 3, 4]);
        assert_eq!(median_match_index(&p), 2);
    }

    #[test]
    fn empty_progress_is_zero() {
        let p = HashMap::new();
        assert_eq!(median_match_index(&p), 0);
    }
}
