//! Local/remote digest bookkeeping shared by frame hashes and GameLogic CRCs.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{Frame, PlayerId, PlayerSet};

/// Agreement state of one frame's digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    /// Some digest is still missing and none disagrees so far.
    Pending,
    /// Every expected digest is present and equal to the local one.
    Match,
    /// At least one remote digest differs from the local one.
    Mismatch,
}

/// Consensus for one frame against an expected set of players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusResult {
    /// The evaluated frame.
    pub frame: Frame,
    /// Overall status.
    pub status: ConsensusStatus,
    /// Expected players whose digest has not arrived. Contains the local player if the local
    /// digest is missing.
    pub missing: PlayerSet,
    /// Players whose digest differs from the local one.
    pub mismatched: PlayerSet,
}

/// Local and remote digests per frame, with order-independent mismatch detection.
///
/// A frame is mismatched as soon as both a local digest and a differing remote digest are
/// known, whichever arrived first. Once mismatched, a frame stays mismatched until pruned.
#[derive(Debug, Clone, Default)]
pub struct DigestLedger {
    local: BTreeMap<Frame, u32>,
    remote: BTreeMap<Frame, BTreeMap<PlayerId, u32>>,
    mismatched: BTreeSet<Frame>,
}

impl DigestLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the local digest. Returns `true` if this made `frame` newly mismatched.
    pub fn record_local(&mut self, frame: Frame, value: u32) -> bool {
        self.local.insert(frame, value);
        let differs = self
            .remote
            .get(&frame)
            .is_some_and(|remotes| remotes.values().any(|v| *v != value));
        differs && self.mismatched.insert(frame)
    }

    /// Records a remote digest. Returns `true` if this made `frame` newly mismatched.
    pub fn record_remote(&mut self, frame: Frame, player: PlayerId, value: u32) -> bool {
        self.remote.entry(frame).or_default().insert(player, value);
        let differs = self.local.get(&frame).is_some_and(|local| *local != value);
        differs && self.mismatched.insert(frame)
    }

    /// The local digest of `frame`.
    #[must_use]
    pub fn local(&self, frame: Frame) -> Option<u32> {
        self.local.get(&frame).copied()
    }

    /// The digest `player` reported for `frame`.
    #[must_use]
    pub fn remote(&self, frame: Frame, player: PlayerId) -> Option<u32> {
        self.remote.get(&frame)?.get(&player).copied()
    }

    /// True if `frame` has a remote digest that differs from the local one.
    #[must_use]
    pub fn is_mismatched(&self, frame: Frame) -> bool {
        self.mismatched.contains(&frame)
    }

    /// Every mismatched frame, ascending.
    #[must_use]
    pub fn mismatched_frames(&self) -> Vec<Frame> {
        self.mismatched.iter().copied().collect()
    }

    /// Frames that cannot be validated yet: the local digest is known but some expected remote
    /// is missing, or remotes arrived before the local digest.
    #[must_use]
    pub fn pending_validation_frames(&self, expected: &[PlayerId]) -> Vec<Frame> {
        let mut frames: BTreeSet<Frame> = self
            .local
            .keys()
            .copied()
            .filter(|frame| !self.pending_validation_players(*frame, expected).is_empty())
            .collect();
        frames.extend(
            self.remote
                .keys()
                .copied()
                .filter(|frame| !self.local.contains_key(frame)),
        );
        frames.into_iter().collect()
    }

    /// Expected players that have not reported a digest for `frame`.
    #[must_use]
    pub fn pending_validation_players(&self, frame: Frame, expected: &[PlayerId]) -> PlayerSet {
        let remotes = self.remote.get(&frame);
        expected
            .iter()
            .copied()
            .filter(|player| !remotes.is_some_and(|r| r.contains_key(player)))
            .collect()
    }

    /// Consensus for `frame` over `expected` remote players. `self_id` is skipped in `expected`
    /// and reported missing when the local digest is unknown.
    ///
    /// Without a local digest no remote can be judged, so the result is at best pending.
    #[must_use]
    pub fn consensus(&self, frame: Frame, expected: &[PlayerId], self_id: PlayerId) -> ConsensusResult {
        let local = self.local(frame);
        let mut missing = PlayerSet::new();
        let mut mismatched = PlayerSet::new();

        if local.is_none() {
            missing.push(self_id);
        }
        for player in expected.iter().copied().filter(|p| *p != self_id) {
            match (self.remote(frame, player), local) {
                (None, _) => missing.push(player),
                (Some(remote), Some(local)) if remote != local => mismatched.push(player),
                _ => {},
            }
        }

        let status = if !mismatched.is_empty() {
            ConsensusStatus::Mismatch
        } else if !missing.is_empty() {
            ConsensusStatus::Pending
        } else {
            ConsensusStatus::Match
        };
        ConsensusResult {
            frame,
            status,
            missing,
            mismatched,
        }
    }

    /// Forgets everything about frames before `frame`, including their mismatch state.
    pub fn prune_before(&mut self, frame: Frame) {
        self.local = self.local.split_off(&frame);
        self.remote = self.remote.split_off(&frame);
        self.mismatched = self.mismatched.split_off(&frame);
    }

    /// Number of frames with any recorded digest.
    #[must_use]
    pub fn tracked_frames(&self) -> usize {
        self.local
            .keys()
            .chain(self.remote.keys())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const F: Frame = Frame::new(5);

    fn p(id: u8) -> PlayerId {
        PlayerId::new(id)
    }

    #[test]
    fn equal_digests_do_not_mismatch() {
        let mut ledger = DigestLedger::new();
        assert!(!ledger.record_local(F, 0xaa));
        assert!(!ledger.record_remote(F, p(1), 0xaa));
        assert!(!ledger.is_mismatched(F));
    }

    #[test]
    fn mismatch_fires_once_per_frame() {
        let mut ledger = DigestLedger::new();
        ledger.record_local(F, 0xaa);
        assert!(ledger.record_remote(F, p(1), 0xab));
        assert!(!ledger.record_remote(F, p(2), 0xac));
        assert!(!ledger.record_remote(F, p(1), 0xab));
        assert_eq!(ledger.mismatched_frames(), vec![F]);
    }

    #[test]
    fn remote_before_local_detects_the_same_mismatch() {
        let mut ledger = DigestLedger::new();
        assert!(!ledger.record_remote(F, p(1), 0xab));
        assert!(ledger.record_local(F, 0xaa));
        assert!(ledger.is_mismatched(F));
    }

    #[test]
    fn mismatch_persists_until_pruned() {
        let mut ledger = DigestLedger::new();
        ledger.record_local(F, 1);
        ledger.record_remote(F, p(1), 2);
        ledger.record_local(F, 2);
        assert!(ledger.is_mismatched(F));

        ledger.prune_before(F);
        assert!(ledger.is_mismatched(F));
        ledger.prune_before(F + 1);
        assert!(!ledger.is_mismatched(F));
        assert_eq!(ledger.local(F), None);
        assert_eq!(ledger.tracked_frames(), 0);
    }

    #[test]
    fn consensus_states() {
        let mut ledger = DigestLedger::new();
        let expected = [p(0), p(1), p(2)];

        let result = ledger.consensus(F, &expected, p(0));
        assert_eq!(result.status, ConsensusStatus::Pending);
        assert_eq!(result.missing.as_slice(), &[p(0), p(1), p(2)]);

        ledger.record_local(F, 9);
        ledger.record_remote(F, p(1), 9);
        let result = ledger.consensus(F, &expected, p(0));
        assert_eq!(result.status, ConsensusStatus::Pending);
        assert_eq!(result.missing.as_slice(), &[p(2)]);

        ledger.record_remote(F, p(2), 9);
        assert_eq!(ledger.consensus(F, &expected, p(0)).status, ConsensusStatus::Match);

        ledger.record_remote(F, p(2), 8);
        let result = ledger.consensus(F, &expected, p(0));
        assert_eq!(result.status, ConsensusStatus::Mismatch);
        assert_eq!(result.mismatched.as_slice(), &[p(2)]);
    }

    #[test]
    fn mismatch_outranks_missing() {
        let mut ledger = DigestLedger::new();
        ledger.record_local(F, 1);
        ledger.record_remote(F, p(1), 2);
        let result = ledger.consensus(F, &[p(1), p(2)], p(0));
        assert_eq!(result.status, ConsensusStatus::Mismatch);
        assert_eq!(result.missing.as_slice(), &[p(2)]);
    }

    #[test]
    fn pending_validation() {
        let mut ledger = DigestLedger::new();
        ledger.record_local(Frame::new(1), 1);
        ledger.record_remote(Frame::new(1), p(1), 1);
        ledger.record_local(Frame::new(2), 1);
        ledger.record_remote(Frame::new(3), p(1), 1);

        assert_eq!(
            ledger.pending_validation_frames(&[p(1)]),
            vec![Frame::new(2), Frame::new(3)]
        );
        assert_eq!(
            ledger.pending_validation_players(Frame::new(2), &[p(1), p(2)]).as_slice(),
            &[p(1), p(2)]
        );
    }
}
