//! Building blocks of the disconnect state machine: vote tallies, disconnect-frame receipts and
//! packet-router hand-off.
//!
//! [`DeterministicFrameState`](crate::DeterministicFrameState) composes these; they are exposed
//! separately for property tests.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;
use web_time::{Duration, Instant};

use crate::{Frame, PlayerId, PlayerSet};

/// A peer that needs commands resent because it is behind a newly accepted disconnect frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResendTarget {
    /// The lagging peer.
    pub player: PlayerId,
    /// The first frame it is missing.
    pub from_frame: Frame,
}

/// Outcome of waiting for the packet router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRouterWait {
    /// The router still has time to answer.
    Waiting {
        /// Time left before re-election.
        remaining: Duration,
    },
    /// The router timed out and the next connected player in the order took over.
    Reelected {
        /// The router that timed out.
        previous: PlayerId,
        /// The new router.
        next: PlayerId,
    },
    /// No connected player is left to act as router.
    NoCandidate,
}

/// The composed disconnect decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectStatus {
    /// Every connected player reported the same disconnect frame.
    pub all_on_same_frame: bool,
    /// The local player is the current packet router.
    pub local_is_packet_router: bool,
    /// Connected peers that stayed silent longer than the player timeout.
    pub timed_out: PlayerSet,
    /// Connected peers that a quorum voted to disconnect.
    pub voted_out: PlayerSet,
    /// Players the local peer should disconnect now. Only the packet router decides, and only
    /// once everyone agrees on the frame; otherwise this is empty.
    pub players_to_disconnect: PlayerSet,
}

/// Disconnect votes keyed by `(candidate, frame)`, remembering who cast them.
#[derive(Debug, Clone, Default)]
pub struct DisconnectVotes {
    tallies: BTreeMap<(PlayerId, Frame), BTreeSet<PlayerId>>,
}

impl DisconnectVotes {
    /// Creates an empty tally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `caster`'s vote to disconnect `candidate` at `frame`. Returns `false` if the
    /// vote was already counted.
    pub fn cast(&mut self, candidate: PlayerId, frame: Frame, caster: PlayerId) -> bool {
        self.tallies.entry((candidate, frame)).or_default().insert(caster)
    }

    /// Number of distinct casters for `(candidate, frame)`.
    #[must_use]
    pub fn count(&self, candidate: PlayerId, frame: Frame) -> usize {
        self.tallies.get(&(candidate, frame)).map_or(0, BTreeSet::len)
    }

    /// Votes needed to disconnect a candidate when `eligible` players (the connected players
    /// other than the candidate) may vote: a strict majority.
    #[must_use]
    pub const fn quorum(eligible: usize) -> usize {
        eligible / 2 + 1
    }

    /// True once a strict majority of the connected players other than `candidate` voted
    /// against it at `frame`. Votes from disconnected casters do not count.
    #[must_use]
    pub fn is_voted_out(&self, candidate: PlayerId, frame: Frame, connected: &[PlayerId]) -> bool {
        let eligible: Vec<PlayerId> = connected.iter().copied().filter(|p| *p != candidate).collect();
        if eligible.is_empty() {
            return false;
        }
        let votes = self.tallies.get(&(candidate, frame)).map_or(0, |casters| {
            casters.iter().filter(|c| eligible.contains(*c)).count()
        });
        votes >= Self::quorum(eligible.len())
    }

    /// Candidates that reached quorum at any tracked frame.
    #[must_use]
    pub fn voted_out_candidates(&self, connected: &[PlayerId]) -> PlayerSet {
        let mut out: PlayerSet = self
            .tallies
            .keys()
            .filter(|(candidate, frame)| {
                connected.contains(candidate) && self.is_voted_out(*candidate, *frame, connected)
            })
            .map(|(candidate, _)| *candidate)
            .collect();
        out.dedup();
        out
    }

    /// Withdraws `caster`'s votes cast at frames before `frame`.
    pub fn clear_caster_before(&mut self, caster: PlayerId, frame: Frame) {
        self.remove_caster_where(caster, |vote_frame| vote_frame < frame);
    }

    /// Withdraws `caster`'s votes cast at `frame`.
    pub fn clear_caster_at(&mut self, caster: PlayerId, frame: Frame) {
        self.remove_caster_where(caster, |vote_frame| vote_frame == frame);
    }

    /// Withdraws every vote `caster` cast.
    pub fn clear_caster(&mut self, caster: PlayerId) {
        self.remove_caster_where(caster, |_| true);
    }

    /// Drops every vote against `candidate`.
    pub fn clear_candidate(&mut self, candidate: PlayerId) {
        self.tallies.retain(|(c, _), _| *c != candidate);
    }

    /// Drops votes cast at frames before `frame`.
    pub fn prune_before(&mut self, frame: Frame) {
        self.tallies.retain(|(_, f), _| *f >= frame);
    }

    fn remove_caster_where(&mut self, caster: PlayerId, mut matches: impl FnMut(Frame) -> bool) {
        self.tallies.retain(|(_, frame), casters| {
            if matches(*frame) {
                casters.remove(&caster);
            }
            !casters.is_empty()
        });
    }
}

/// The latest disconnect frame each player reported.
#[derive(Debug, Clone, Default)]
pub struct DisconnectFrames {
    frames: BTreeMap<PlayerId, Frame>,
}

impl DisconnectFrames {
    /// Accepts `frame` for `player` only if it is newer than the tracked one.
    pub fn record(&mut self, player: PlayerId, frame: Frame) -> bool {
        match self.frames.get(&player) {
            Some(current) if *current >= frame => false,
            _ => {
                self.frames.insert(player, frame);
                true
            },
        }
    }

    /// The tracked frame of `player`.
    #[must_use]
    pub fn get(&self, player: PlayerId) -> Option<Frame> {
        self.frames.get(&player).copied()
    }

    /// Clears `player`'s receipt if it equals `frame`. Returns `true` if cleared.
    pub fn clear_if(&mut self, player: PlayerId, frame: Frame) -> bool {
        if self.get(player) == Some(frame) {
            self.frames.remove(&player);
            true
        } else {
            false
        }
    }

    /// Forgets `player`.
    pub fn remove(&mut self, player: PlayerId) {
        self.frames.remove(&player);
    }

    /// True if every player in `players` reported, and all reported the same frame.
    #[must_use]
    pub fn all_equal(&self, players: &[PlayerId]) -> bool {
        let mut frames = players.iter().map(|p| self.get(*p));
        match frames.next() {
            Some(Some(first)) => frames.all(|f| f == Some(first)),
            _ => false,
        }
    }
}

/// Tracks which player acts as packet router and when it was last heard from.
///
/// The router is the first connected player in the configured order that has not timed out.
#[derive(Debug, Clone)]
pub struct PacketRouterTracker {
    order: Vec<PlayerId>,
    skipped: BTreeSet<PlayerId>,
    timeout: Duration,
    last_reset: Option<Instant>,
}

impl PacketRouterTracker {
    /// Creates a tracker with a router order and a re-election timeout.
    #[must_use]
    pub fn new(order: Vec<PlayerId>, timeout: Duration) -> Self {
        Self {
            order,
            skipped: BTreeSet::new(),
            timeout,
            last_reset: None,
        }
    }

    /// Replaces the router order and forgets earlier re-elections.
    pub fn set_order(&mut self, order: Vec<PlayerId>) {
        self.order = order;
        self.skipped.clear();
    }

    /// The current router among `connected`.
    #[must_use]
    pub fn current(&self, connected: &[PlayerId]) -> Option<PlayerId> {
        self.order
            .iter()
            .copied()
            .find(|p| connected.contains(p) && !self.skipped.contains(p))
    }

    /// Restarts the wait, typically when the router answered.
    pub fn reset_timeout(&mut self, now: Instant) {
        self.last_reset = Some(now);
    }

    /// Checks the router's deadline. The first call starts the wait. On timeout the next
    /// connected player in the order becomes router and the wait restarts.
    pub fn evaluate(&mut self, now: Instant, connected: &[PlayerId]) -> PacketRouterWait {
        let Some(current) = self.current(connected) else {
            return PacketRouterWait::NoCandidate;
        };
        let started = *self.last_reset.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.timeout {
            return PacketRouterWait::Waiting {
                remaining: self.timeout - elapsed,
            };
        }

        self.skipped.insert(current);
        self.last_reset = Some(now);
        match self.current(connected) {
            Some(next) => {
                debug!("Packet router {} timed out; {} takes over", current, next);
                PacketRouterWait::Reelected {
                    previous: current,
                    next,
                }
            },
            None => PacketRouterWait::NoCandidate,
        }
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

    fn p(id: u8) -> PlayerId {
        PlayerId::new(id)
    }

    fn all(n: u8) -> Vec<PlayerId> {
        (0..n).map(PlayerId::new).collect()
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(DisconnectVotes::quorum(1), 1);
        assert_eq!(DisconnectVotes::quorum(2), 2);
        assert_eq!(DisconnectVotes::quorum(3), 2);
        assert_eq!(DisconnectVotes::quorum(7), 4);
    }

    #[test]
    fn voted_out_flips_exactly_at_quorum() {
        let mut votes = DisconnectVotes::new();
        let connected = all(4);
        let frame = Frame::new(30);
        assert!(votes.cast(p(3), frame, p(0)));
        assert!(!votes.cast(p(3), frame, p(0)));
        assert!(!votes.is_voted_out(p(3), frame, &connected));
        votes.cast(p(3), frame, p(1));
        assert!(votes.is_voted_out(p(3), frame, &connected));
        assert_eq!(votes.voted_out_candidates(&connected).as_slice(), &[p(3)]);
    }

    #[test]
    fn votes_from_the_candidate_or_strangers_do_not_count() {
        let mut votes = DisconnectVotes::new();
        let connected = all(3);
        let frame = Frame::new(1);
        votes.cast(p(2), frame, p(2));
        votes.cast(p(2), frame, p(6));
        assert_eq!(votes.count(p(2), frame), 2);
        assert!(!votes.is_voted_out(p(2), frame, &connected));
    }

    #[test]
    fn fresher_frame_supersedes_older_votes() {
        let mut votes = DisconnectVotes::new();
        votes.cast(p(3), Frame::new(10), p(0));
        votes.cast(p(3), Frame::new(12), p(0));
        votes.cast(p(3), Frame::new(10), p(1));
        votes.clear_caster_before(p(0), Frame::new(12));
        assert_eq!(votes.count(p(3), Frame::new(10)), 1);
        assert_eq!(votes.count(p(3), Frame::new(12)), 1);
        votes.clear_caster(p(0));
        assert_eq!(votes.count(p(3), Frame::new(12)), 0);
    }

    #[test]
    fn disconnect_frames_are_monotonic() {
        let mut frames = DisconnectFrames::default();
        assert!(frames.record(p(1), Frame::new(5)));
        assert!(!frames.record(p(1), Frame::new(5)));
        assert!(!frames.record(p(1), Frame::new(4)));
        assert!(frames.record(p(1), Frame::new(6)));
        assert!(!frames.clear_if(p(1), Frame::new(5)));
        assert!(frames.clear_if(p(1), Frame::new(6)));
        assert_eq!(frames.get(p(1)), None);
    }

    #[test]
    fn all_equal_requires_every_player() {
        let mut frames = DisconnectFrames::default();
        frames.record(p(0), Frame::new(3));
        assert!(!frames.all_equal(&[p(0), p(1)]));
        frames.record(p(1), Frame::new(3));
        assert!(frames.all_equal(&[p(0), p(1)]));
        frames.record(p(1), Frame::new(4));
        assert!(!frames.all_equal(&[p(0), p(1)]));
        assert!(!frames.all_equal(&[]));
    }

    #[test]
    fn router_reelection_follows_order_and_connectivity() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut tracker = PacketRouterTracker::new(vec![p(2), p(0), p(1)], timeout);
        let connected = vec![p(0), p(1), p(2)];
        assert_eq!(tracker.current(&connected), Some(p(2)));

        assert_eq!(
            tracker.evaluate(start, &connected),
            PacketRouterWait::Waiting { remaining: timeout }
        );
        tracker.reset_timeout(start + Duration::from_secs(5));
        assert!(matches!(
            tracker.evaluate(start + Duration::from_secs(12), &connected),
            PacketRouterWait::Waiting { .. }
        ));
        assert_eq!(
            tracker.evaluate(start + Duration::from_secs(15), &connected),
            PacketRouterWait::Reelected {
                previous: p(2),
                next: p(0)
            }
        );
        // player 0 left; the next in order is 1
        assert_eq!(tracker.current(&[p(1), p(2)]), Some(p(1)));
        assert_eq!(tracker.evaluate(start, &[]), PacketRouterWait::NoCandidate);
    }
}
