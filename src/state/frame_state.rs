//! Per-player frame readiness and the disconnect state machine.
//!
//! # Readiness
//!
//! Every peer announces how many commands it sent for a frame (a FRAMEINFO count) and then
//! sends them. A player is ready for a frame once the announced count is known and exactly
//! that many commands arrived. Counts and commands may arrive in either order:
//!
//! - A command that arrives before its count is kept, and the gap asks for a resend of that
//!   `(player, frame)` once.
//! - More commands than announced is a [`FrameStateEvent::CommandCountMismatch`]. The flag
//!   stays set until the frame is pruned.
//!
//! # Disconnect
//!
//! When the local peer waits too long for a frame, [`evaluate_disconnect_stall`] turns the stall
//! indicator on and then paces disconnect keepalives. Peers exchange disconnect frames, votes
//! and screen-off notices; [`evaluate_disconnect_status`] composes them into the list of
//! players to drop. Only the packet router decides, and only once every connected player
//! reported the same disconnect frame.
//!
//! [`evaluate_disconnect_stall`]: DeterministicFrameState::evaluate_disconnect_stall
//! [`evaluate_disconnect_status`]: DeterministicFrameState::evaluate_disconnect_status

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};
use web_time::Instant;

use crate::error::{ensure_valid_frame, ensure_valid_player};
use crate::event_drain::EventDrain;
use crate::network::messages::{CommandBody, NetCommand};
use crate::report_violation_to;
use crate::state::disconnect::{
    DisconnectFrames, DisconnectStatus, DisconnectVotes, PacketRouterTracker, PacketRouterWait,
    ResendTarget,
};
use crate::state::slots::{from_translated_slot, to_translated_slot};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{DisconnectConfig, Frame, LockstepError, PlayerId, PlayerSet};

/// Whether the disconnect screen is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationState {
    /// Normal play.
    #[default]
    ScreenOff,
    /// The stall indicator is on; the match waits for peers or for a disconnect decision.
    ScreenOn,
}

/// Readiness of one player for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerFrameReadiness {
    /// The count is known and every command arrived.
    Ready,
    /// No command count has been announced yet.
    AwaitingCount {
        /// Commands that arrived anyway.
        received: u32,
    },
    /// The count is known but commands are still missing.
    AwaitingCommands {
        /// Commands received so far.
        received: u32,
        /// Announced count.
        expected: u32,
    },
    /// More commands arrived than announced.
    Mismatch {
        /// Commands received so far.
        received: u32,
        /// Announced count.
        expected: u32,
    },
}

impl PlayerFrameReadiness {
    /// True for [`PlayerFrameReadiness::Ready`].
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// What applying a disconnect command from the wire did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCommandOutcome {
    /// A DISCONNECTVOTE was resolved to `candidate`; `counted` is false for a repeated or
    /// ignored vote.
    Vote {
        /// The absolute slot voted against.
        candidate: PlayerId,
        /// Whether the vote was new.
        counted: bool,
    },
    /// The packet router announced that `player` is out.
    PlayerDisconnected {
        /// The absolute slot that was disconnected.
        player: PlayerId,
    },
    /// A DISCONNECTFRAME; see [`DeterministicFrameState::record_disconnect_frame`].
    DisconnectFrame {
        /// Peers to resend to, or `None` if the frame was stale.
        targets: Option<Vec<ResendTarget>>,
    },
    /// A DISCONNECTSCREENOFF; `receipt_cleared` as returned by
    /// [`DeterministicFrameState::record_disconnect_screen_off`].
    ScreenOff {
        /// Whether the sender's disconnect-frame receipt matched and was cleared.
        receipt_cleared: bool,
    },
    /// A DISCONNECTKEEPALIVE refreshed the sender's timeout.
    KeepAlive,
    /// Not a disconnect command, or a DISCONNECTPLAYER from a peer that is not the router.
    Ignored,
}

/// Readiness of a frame across the connected players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameReadiness {
    /// The evaluated frame.
    pub frame: Frame,
    /// Every connected player is ready.
    pub players_ready: bool,
    /// The continuation gate allowed the frame. Always `true` for
    /// [`DeterministicFrameState::evaluate_frame_readiness`].
    pub gate_passed: bool,
    /// Connected players that are not ready yet.
    pub waiting_on: PlayerSet,
    /// Connected players that sent more commands than announced.
    pub mismatched: PlayerSet,
}

impl FrameReadiness {
    /// True if the frame may be executed.
    #[must_use]
    pub const fn can_execute(&self) -> bool {
        self.players_ready && self.gate_passed
    }
}

/// Result of a stall evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallUpdate {
    /// The local peer is not waiting.
    NotStalled,
    /// Waiting, but not for long enough to show the indicator.
    Waiting,
    /// The indicator turned on with this call. Send a disconnect keepalive now.
    IndicatorOn,
    /// The indicator is on and the keepalive interval elapsed. Send a disconnect keepalive.
    SendKeepAlive,
    /// The indicator is on and nothing needs sending yet.
    Stalled,
}

/// Notifications queued by [`DeterministicFrameState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStateEvent {
    /// Commands for `(player, frame)` arrived without a count; ask `player` to resend the frame.
    ResendRequested {
        /// The player to ask.
        player: PlayerId,
        /// The frame to resend.
        frame: Frame,
    },
    /// `player` sent more commands for `frame` than it announced.
    CommandCountMismatch {
        /// The offending player.
        player: PlayerId,
        /// The frame.
        frame: Frame,
        /// Announced count.
        expected: u32,
        /// Commands received.
        received: u32,
    },
    /// The stall indicator turned on.
    StallIndicatorOn,
    /// A frame passed readiness while the indicator was on; the disconnect screen goes away.
    DisconnectScreenOff {
        /// The frame that unblocked.
        frame: Frame,
    },
    /// The packet router timed out and another player took over.
    PacketRouterReelected {
        /// The router that timed out.
        previous: PlayerId,
        /// The new router.
        next: PlayerId,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameCounts {
    expected: Option<u32>,
    received: u32,
}

impl FrameCounts {
    fn readiness(self) -> PlayerFrameReadiness {
        match self.expected {
            None => PlayerFrameReadiness::AwaitingCount {
                received: self.received,
            },
            Some(expected) if self.received == expected => PlayerFrameReadiness::Ready,
            Some(expected) if self.received < expected => PlayerFrameReadiness::AwaitingCommands {
                received: self.received,
                expected,
            },
            Some(expected) => PlayerFrameReadiness::Mismatch {
                received: self.received,
                expected,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StallTimer {
    waiting_since: Option<Instant>,
    indicator_on: bool,
    last_keepalive: Option<Instant>,
}

type ContinuationGate = Box<dyn Fn(Frame) -> bool>;

/// Frame readiness, resend triggering and disconnect handling of one peer.
pub struct DeterministicFrameState {
    config: DisconnectConfig,
    local_player: PlayerId,
    connected: BTreeSet<PlayerId>,
    counts: BTreeMap<(Frame, PlayerId), FrameCounts>,
    resend_requested: BTreeSet<(Frame, PlayerId)>,
    count_mismatches: BTreeSet<(Frame, PlayerId)>,
    continuation: ContinuationState,
    continuation_gate: Option<ContinuationGate>,
    stall: StallTimer,
    votes: DisconnectVotes,
    disconnect_frames: DisconnectFrames,
    last_heard: BTreeMap<PlayerId, Instant>,
    packet_router: PacketRouterTracker,
    event_queue: VecDeque<FrameStateEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for DeterministicFrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicFrameState")
            .field("local_player", &self.local_player)
            .field("connected", &self.connected)
            .field("tracked_counts", &self.counts.len())
            .field("continuation", &self.continuation)
            .field("has_continuation_gate", &self.continuation_gate.is_some())
            .field("stall", &self.stall)
            .field("votes", &self.votes)
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl DeterministicFrameState {
    /// Creates the state for `local_player` with every slot of the match connected and the packet
    /// router order `0..num_slots`.
    pub fn new(config: DisconnectConfig, local_player: PlayerId) -> Result<Self, LockstepError> {
        config.validate()?;
        ensure_valid_player(local_player, config.num_slots)?;
        let slots: Vec<PlayerId> = (0..config.num_slots)
            .filter_map(|slot| u8::try_from(slot).ok())
            .map(PlayerId::new)
            .collect();
        Ok(Self {
            config,
            local_player,
            connected: slots.iter().copied().collect(),
            counts: BTreeMap::new(),
            resend_requested: BTreeSet::new(),
            count_mismatches: BTreeSet::new(),
            continuation: ContinuationState::default(),
            continuation_gate: None,
            stall: StallTimer::default(),
            votes: DisconnectVotes::new(),
            disconnect_frames: DisconnectFrames::default(),
            last_heard: BTreeMap::new(),
            packet_router: PacketRouterTracker::new(slots, config.packet_router_timeout),
            event_queue: VecDeque::new(),
            violation_observer: None,
        })
    }

    /// Routes violations to `observer` instead of the tracing fallback.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Installs the predicate consulted by [`Self::evaluate_frame_execution_readiness`] after
    /// every connected player is ready. The predicate must not touch this state.
    pub fn set_continuation_gate(&mut self, gate: impl Fn(Frame) -> bool + 'static) {
        self.continuation_gate = Some(Box::new(gate));
    }

    /// Drains queued [`FrameStateEvent`]s.
    pub fn events(&mut self) -> EventDrain<'_, FrameStateEvent> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// The local player.
    #[must_use]
    pub const fn local_player(&self) -> PlayerId {
        self.local_player
    }

    /// Whether the disconnect screen is showing.
    #[must_use]
    pub const fn continuation_state(&self) -> ContinuationState {
        self.continuation
    }

    // ###############
    // # CONNECTIONS #
    // ###############

    /// Marks `player` as connected.
    pub fn connect_player(&mut self, player: PlayerId) -> Result<(), LockstepError> {
        ensure_valid_player(player, self.config.num_slots)?;
        if self.connected.insert(player) {
            debug!("Player {} connected", player);
        }
        Ok(())
    }

    /// Marks `player` as gone and forgets its votes, receipts and keepalives.
    pub fn disconnect_player(&mut self, player: PlayerId) -> Result<(), LockstepError> {
        ensure_valid_player(player, self.config.num_slots)?;
        if self.connected.remove(&player) {
            debug!("Player {} disconnected", player);
        }
        self.votes.clear_candidate(player);
        self.votes.clear_caster(player);
        self.disconnect_frames.remove(player);
        self.last_heard.remove(&player);
        Ok(())
    }

    /// True if `player` is connected.
    #[must_use]
    pub fn is_connected(&self, player: PlayerId) -> bool {
        self.connected.contains(&player)
    }

    /// Connected players, ascending.
    #[must_use]
    pub fn connected_players(&self) -> Vec<PlayerId> {
        self.connected.iter().copied().collect()
    }

    // #############
    // # READINESS #
    // #############

    /// Records the number of commands `player` announced for `frame`.
    pub fn set_expected_command_count(
        &mut self,
        player: PlayerId,
        frame: Frame,
        count: u32,
    ) -> Result<(), LockstepError> {
        self.validate(player, frame)?;
        let counts = self.counts.entry((frame, player)).or_default();
        counts.expected = Some(count);
        let received = counts.received;
        trace!("Player {} announced {} commands for frame {}", player, count, frame);
        if received > count {
            self.on_count_mismatch(player, frame, count, received);
        }
        Ok(())
    }

    /// Records one command from `player` for `frame`.
    pub fn record_command_received(
        &mut self,
        player: PlayerId,
        frame: Frame,
    ) -> Result<(), LockstepError> {
        self.validate(player, frame)?;
        let counts = self.counts.entry((frame, player)).or_default();
        counts.received = counts.received.saturating_add(1);
        let FrameCounts { expected, received } = *counts;
        match expected {
            None => {
                if self.resend_requested.insert((frame, player)) {
                    debug!(
                        "Command from player {} for frame {} arrived before its count; requesting resend",
                        player, frame
                    );
                    self.event_queue
                        .push_back(FrameStateEvent::ResendRequested { player, frame });
                }
            },
            Some(expected) if received > expected => {
                self.on_count_mismatch(player, frame, expected, received);
            },
            Some(_) => {},
        }
        Ok(())
    }

    /// The announced count of `(player, frame)`.
    #[must_use]
    pub fn expected_command_count(&self, player: PlayerId, frame: Frame) -> Option<u32> {
        self.counts.get(&(frame, player))?.expected
    }

    /// Commands received from `player` for `frame`.
    #[must_use]
    pub fn received_command_count(&self, player: PlayerId, frame: Frame) -> u32 {
        self.counts.get(&(frame, player)).map_or(0, |c| c.received)
    }

    /// True if `player` ever sent more commands for `frame` than announced.
    #[must_use]
    pub fn has_command_count_mismatch(&self, player: PlayerId, frame: Frame) -> bool {
        self.count_mismatches.contains(&(frame, player))
    }

    /// True if a resend of `(player, frame)` was requested.
    #[must_use]
    pub fn is_resend_requested(&self, player: PlayerId, frame: Frame) -> bool {
        self.resend_requested.contains(&(frame, player))
    }

    /// Readiness of one player.
    #[must_use]
    pub fn player_frame_readiness(&self, player: PlayerId, frame: Frame) -> PlayerFrameReadiness {
        self.counts
            .get(&(frame, player))
            .copied()
            .unwrap_or_default()
            .readiness()
    }

    /// Readiness of `frame` across the connected players, without the continuation gate and
    /// without side effects.
    #[must_use]
    pub fn evaluate_frame_readiness(&self, frame: Frame) -> FrameReadiness {
        let mut waiting_on = PlayerSet::new();
        let mut mismatched = PlayerSet::new();
        for player in self.connected.iter().copied() {
            match self.player_frame_readiness(player, frame) {
                PlayerFrameReadiness::Ready => {},
                PlayerFrameReadiness::Mismatch { .. } => {
                    waiting_on.push(player);
                    mismatched.push(player);
                },
                _ => waiting_on.push(player),
            }
        }
        FrameReadiness {
            frame,
            players_ready: waiting_on.is_empty(),
            gate_passed: true,
            waiting_on,
            mismatched,
        }
    }

    /// Readiness of `frame` including the continuation gate.
    ///
    /// When the frame may execute and the disconnect screen is on, the screen turns off (once),
    /// the stall timer restarts and the local player's votes for `frame` are withdrawn.
    pub fn evaluate_frame_execution_readiness(
        &mut self,
        frame: Frame,
    ) -> Result<FrameReadiness, LockstepError> {
        ensure_valid_frame(frame)?;
        let mut readiness = self.evaluate_frame_readiness(frame);
        readiness.gate_passed = readiness.players_ready
            && self.continuation_gate.as_ref().is_none_or(|gate| gate(frame));

        if readiness.can_execute() {
            self.stall = StallTimer::default();
            if self.continuation == ContinuationState::ScreenOn {
                debug!("Frame {} is ready; disconnect screen off", frame);
                self.continuation = ContinuationState::ScreenOff;
                self.votes.clear_caster_at(self.local_player, frame);
                self.event_queue
                    .push_back(FrameStateEvent::DisconnectScreenOff { frame });
            }
        }
        Ok(readiness)
    }

    // #########
    // # STALL #
    // #########

    /// Advances the stall timer. `waiting` tells whether the local peer is currently blocked on
    /// a frame.
    ///
    /// The indicator turns on exactly once after `stall_timeout` of continuous waiting. From
    /// then on a keepalive is due every `keepalive_interval`.
    pub fn evaluate_disconnect_stall(&mut self, now: Instant, waiting: bool) -> StallUpdate {
        if !waiting {
            if !self.stall.indicator_on {
                self.stall.waiting_since = None;
            }
            return StallUpdate::NotStalled;
        }
        let since = *self.stall.waiting_since.get_or_insert(now);

        if !self.stall.indicator_on {
            if now.saturating_duration_since(since) < self.config.stall_timeout {
                return StallUpdate::Waiting;
            }
            debug!("Stalled for {:?}; stall indicator on", now.saturating_duration_since(since));
            self.stall.indicator_on = true;
            self.stall.last_keepalive = Some(now);
            self.continuation = ContinuationState::ScreenOn;
            self.event_queue.push_back(FrameStateEvent::StallIndicatorOn);
            return StallUpdate::IndicatorOn;
        }

        let keepalive_due = self.stall.last_keepalive.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.keepalive_interval
        });
        if keepalive_due {
            trace!("Disconnect keepalive due");
            self.stall.last_keepalive = Some(now);
            StallUpdate::SendKeepAlive
        } else {
            StallUpdate::Stalled
        }
    }

    /// True once the stall indicator is on and until a frame executes again.
    #[must_use]
    pub const fn is_stall_indicator_on(&self) -> bool {
        self.stall.indicator_on
    }

    /// Records that `player` was heard from (any packet or disconnect keepalive).
    pub fn record_player_keepalive(
        &mut self,
        player: PlayerId,
        now: Instant,
    ) -> Result<(), LockstepError> {
        ensure_valid_player(player, self.config.num_slots)?;
        self.last_heard.insert(player, now);
        Ok(())
    }

    // ##########
    // # VOTING #
    // ##########

    /// Records `caster`'s vote to disconnect `candidate` at `frame`. Returns `false` for a
    /// repeated vote.
    pub fn cast_disconnect_vote(
        &mut self,
        candidate: PlayerId,
        frame: Frame,
        caster: PlayerId,
    ) -> Result<bool, LockstepError> {
        self.validate(candidate, frame)?;
        ensure_valid_player(caster, self.config.num_slots)?;
        if !self.connected.contains(&caster) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Disconnect,
                frame,
                "disconnect vote from disconnected player {} ignored",
                caster
            );
            return Ok(false);
        }
        let added = self.votes.cast(candidate, frame, caster);
        if added {
            debug!("Player {} votes to disconnect {} at frame {}", caster, candidate, frame);
        }
        Ok(added)
    }

    /// Records a vote whose candidate is a translated slot relative to `caster`, the form a
    /// player's disconnect screen and the DISCONNECTVOTE wire command use.
    pub fn cast_translated_disconnect_vote(
        &mut self,
        translated: u8,
        frame: Frame,
        caster: PlayerId,
    ) -> Result<bool, LockstepError> {
        let candidate = self.untranslate(translated, caster)?;
        self.cast_disconnect_vote(candidate, frame, caster)
    }

    /// The local player's translated slot for `player`; `None` for the local player.
    #[must_use]
    pub fn translated_slot(&self, player: PlayerId) -> Option<u8> {
        to_translated_slot(player, self.local_player)
    }

    /// Number of votes against `candidate` at `frame`.
    #[must_use]
    pub fn disconnect_vote_count(&self, candidate: PlayerId, frame: Frame) -> usize {
        self.votes.count(candidate, frame)
    }

    /// True once a strict majority of the connected players other than `candidate` voted
    /// against it at `frame`.
    #[must_use]
    pub fn is_disconnect_slot_voted_out(&self, candidate: PlayerId, frame: Frame) -> bool {
        self.votes
            .is_voted_out(candidate, frame, &self.connected_players())
    }

    // ######################
    // # DISCONNECT FRAMES  #
    // ######################

    /// Records the disconnect frame `player` reported.
    ///
    /// Returns `None` if the frame is not newer than the tracked one. Otherwise `player`'s
    /// older votes are withdrawn and the returned targets list every connected remote peer
    /// whose own disconnect frame lags the accepted one, with the first frame it misses. A peer
    /// that has not reported a disconnect frame lags from frame 0; the archive clamps that to
    /// its retention window.
    pub fn record_disconnect_frame(
        &mut self,
        player: PlayerId,
        frame: Frame,
    ) -> Result<Option<Vec<ResendTarget>>, LockstepError> {
        self.validate(player, frame)?;
        if !self.disconnect_frames.record(player, frame) {
            trace!("Stale disconnect frame {} from player {} ignored", frame, player);
            return Ok(None);
        }
        debug!("Player {} is at disconnect frame {}", player, frame);
        self.votes.clear_caster_before(player, frame);

        let targets = self
            .connected
            .iter()
            .copied()
            .filter(|peer| *peer != self.local_player && *peer != player)
            .filter_map(|peer| {
                let peer_frame = self.disconnect_frames.get(peer).unwrap_or(Frame::new(0));
                (peer_frame < frame).then_some(ResendTarget {
                    player: peer,
                    from_frame: peer_frame,
                })
            })
            .collect();
        Ok(Some(targets))
    }

    /// The disconnect frame `player` last reported.
    #[must_use]
    pub fn disconnect_frame(&self, player: PlayerId) -> Option<Frame> {
        self.disconnect_frames.get(player)
    }

    /// Records that `player` left its disconnect screen at `frame`.
    ///
    /// `player`'s votes are withdrawn. The disconnect-frame receipt is cleared only if `frame`
    /// equals the tracked one; returns whether it was.
    pub fn record_disconnect_screen_off(
        &mut self,
        player: PlayerId,
        frame: Frame,
    ) -> Result<bool, LockstepError> {
        self.validate(player, frame)?;
        self.votes.clear_caster(player);
        let cleared = self.disconnect_frames.clear_if(player, frame);
        if cleared {
            debug!("Player {} left the disconnect screen at frame {}", player, frame);
        } else {
            trace!(
                "Screen-off from player {} for frame {} does not match its disconnect frame",
                player, frame
            );
        }
        Ok(cleared)
    }

    /// Applies a disconnect command received from `command.header.player_id`.
    ///
    /// Slots in DISCONNECTVOTE and DISCONNECTPLAYER are translated relative to the sender and
    /// are mapped back to absolute slots here. DISCONNECTPLAYER is honored only from the
    /// current packet router.
    pub fn apply_disconnect_command(
        &mut self,
        command: &NetCommand,
        now: Instant,
    ) -> Result<DisconnectCommandOutcome, LockstepError> {
        let sender = PlayerId::new(command.header.player_id);
        let wire_frame = |frame: u32| Frame::from_wire(frame).unwrap_or(Frame::NULL);
        match &command.body {
            CommandBody::DisconnectVote { slot, vote_frame } => {
                let candidate = self.untranslate(*slot, sender)?;
                let counted = self.cast_disconnect_vote(candidate, wire_frame(*vote_frame), sender)?;
                Ok(DisconnectCommandOutcome::Vote { candidate, counted })
            },
            CommandBody::DisconnectPlayer {
                slot,
                disconnect_frame,
            } => {
                let frame = wire_frame(*disconnect_frame);
                ensure_valid_frame(frame)?;
                let player = self.untranslate(*slot, sender)?;
                if self.packet_router() != Some(sender) {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Disconnect,
                        frame,
                        "player {} tried to disconnect {} without being the packet router",
                        sender,
                        player
                    );
                    return Ok(DisconnectCommandOutcome::Ignored);
                }
                self.disconnect_player(player)?;
                Ok(DisconnectCommandOutcome::PlayerDisconnected { player })
            },
            CommandBody::DisconnectFrame { disconnect_frame } => {
                let targets = self.record_disconnect_frame(sender, wire_frame(*disconnect_frame))?;
                Ok(DisconnectCommandOutcome::DisconnectFrame { targets })
            },
            CommandBody::DisconnectScreenOff { new_frame } => {
                let receipt_cleared =
                    self.record_disconnect_screen_off(sender, wire_frame(*new_frame))?;
                Ok(DisconnectCommandOutcome::ScreenOff { receipt_cleared })
            },
            CommandBody::DisconnectKeepAlive => {
                self.record_player_keepalive(sender, now)?;
                Ok(DisconnectCommandOutcome::KeepAlive)
            },
            _ => Ok(DisconnectCommandOutcome::Ignored),
        }
    }

    // #################
    // # PACKET ROUTER #
    // #################

    /// Sets the packet router order. Earlier re-elections are forgotten.
    pub fn set_packet_router_order(&mut self, order: Vec<PlayerId>) -> Result<(), LockstepError> {
        for player in &order {
            ensure_valid_player(*player, self.config.num_slots)?;
        }
        self.packet_router.set_order(order);
        Ok(())
    }

    /// The current packet router.
    #[must_use]
    pub fn packet_router(&self) -> Option<PlayerId> {
        self.packet_router.current(&self.connected_players())
    }

    /// Restarts the wait for the packet router.
    pub fn reset_packet_router_timeout(&mut self, now: Instant) {
        self.packet_router.reset_timeout(now);
    }

    /// Checks the packet router deadline and re-elects on timeout.
    pub fn evaluate_wait_for_packet_router(&mut self, now: Instant) -> PacketRouterWait {
        let connected = self.connected_players();
        let wait = self.packet_router.evaluate(now, &connected);
        match wait {
            PacketRouterWait::Reelected { previous, next } => {
                self.event_queue
                    .push_back(FrameStateEvent::PacketRouterReelected { previous, next });
            },
            PacketRouterWait::NoCandidate => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Disconnect,
                    Frame::NULL,
                    "no connected player is left to act as packet router"
                );
            },
            PacketRouterWait::Waiting { .. } => {},
        }
        wait
    }

    // ##########
    // # STATUS #
    // ##########

    /// Connected remote players that stayed silent for `player_timeout` while the stall
    /// indicator is on. Silence is measured from the later of the last keepalive and the start
    /// of the stall.
    #[must_use]
    pub fn timed_out_players(&self, now: Instant) -> PlayerSet {
        if !self.stall.indicator_on {
            return PlayerSet::new();
        }
        let Some(stalled_since) = self.stall.waiting_since else {
            return PlayerSet::new();
        };
        self.connected
            .iter()
            .copied()
            .filter(|p| *p != self.local_player)
            .filter(|p| {
                let heard = self
                    .last_heard
                    .get(p)
                    .map_or(stalled_since, |heard| (*heard).max(stalled_since));
                now.saturating_duration_since(heard) >= self.config.player_timeout
            })
            .collect()
    }

    /// Composes disconnect-frame agreement, packet router ownership, timeouts and votes.
    #[must_use]
    pub fn evaluate_disconnect_status(&self, now: Instant) -> DisconnectStatus {
        let connected = self.connected_players();
        let all_on_same_frame = self.disconnect_frames.all_equal(&connected);
        let local_is_packet_router = self.packet_router() == Some(self.local_player);
        let timed_out = self.timed_out_players(now);
        let voted_out: PlayerSet = self
            .votes
            .voted_out_candidates(&connected)
            .into_iter()
            .filter(|p| *p != self.local_player)
            .collect();

        let players_to_disconnect = if all_on_same_frame && local_is_packet_router {
            let union: BTreeSet<PlayerId> = timed_out.iter().chain(voted_out.iter()).copied().collect();
            union.into_iter().collect()
        } else {
            PlayerSet::new()
        };
        DisconnectStatus {
            all_on_same_frame,
            local_is_packet_router,
            timed_out,
            voted_out,
            players_to_disconnect,
        }
    }

    // ###########
    // # PRUNING #
    // ###########

    /// Forgets counts, resend requests, mismatch flags and votes of frames before `frame`.
    pub fn prune_before(&mut self, frame: Frame) {
        self.counts.retain(|(f, _), _| *f >= frame);
        self.resend_requested.retain(|(f, _)| *f >= frame);
        self.count_mismatches.retain(|(f, _)| *f >= frame);
        self.votes.prune_before(frame);
    }

    /// Maps a slot translated relative to `relative_to` back to an absolute slot of this match.
    fn untranslate(&self, translated: u8, relative_to: PlayerId) -> Result<PlayerId, LockstepError> {
        ensure_valid_player(relative_to, self.config.num_slots)?;
        let player = from_translated_slot(translated, relative_to).ok_or_else(|| {
            LockstepError::InvalidRequest {
                info: format!("translated slot {translated} relative to {relative_to} is out of range"),
            }
        })?;
        ensure_valid_player(player, self.config.num_slots)?;
        Ok(player)
    }

    fn validate(&self, player: PlayerId, frame: Frame) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        ensure_valid_player(player, self.config.num_slots)
    }

    fn on_count_mismatch(&mut self, player: PlayerId, frame: Frame, expected: u32, received: u32) {
        if !self.count_mismatches.insert((frame, player)) {
            return;
        }
        debug!(
            "Player {} sent {} commands for frame {} but announced {}",
            player, received, frame, expected
        );
        self.event_queue.push_back(FrameStateEvent::CommandCountMismatch {
            player,
            frame,
            expected,
            received,
        });
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Error,
            ViolationKind::FrameReadiness,
            frame,
            "player {} sent {} commands but announced {}",
            player,
            received,
            expected
        );
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
    use std::cell::Cell;
    use std::rc::Rc;

    use web_time::Duration;

    use super::*;
    use crate::network::messages::CommandHeader;
    use crate::telemetry::CollectingObserver;

    fn p(id: u8) -> PlayerId {
        PlayerId::new(id)
    }

    fn f(frame: i32) -> Frame {
        Frame::new(frame)
    }

    fn state(num_slots: usize, local: u8) -> DeterministicFrameState {
        let config = DisconnectConfig {
            num_slots,
            stall_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(500),
            player_timeout: Duration::from_secs(30),
            packet_router_timeout: Duration::from_secs(10),
        };
        DeterministicFrameState::new(config, p(local)).unwrap()
    }

    fn make_ready(state: &mut DeterministicFrameState, frame: Frame) {
        for player in state.connected_players() {
            state.set_expected_command_count(player, frame, 0).unwrap();
        }
    }

    #[test]
    fn rejects_invalid_arguments() {
        let mut state = state(2, 0);
        assert!(matches!(
            state.set_expected_command_count(p(2), f(1), 1),
            Err(LockstepError::InvalidPlayer { .. })
        ));
        assert!(matches!(
            state.record_command_received(p(1), f(-1)),
            Err(LockstepError::InvalidFrame { .. })
        ));
        assert!(DeterministicFrameState::new(DisconnectConfig::default(), p(8)).is_err());
    }

    #[test]
    fn ready_only_when_received_equals_expected() {
        let mut state = state(2, 0);
        assert_eq!(
            state.player_frame_readiness(p(1), f(3)),
            PlayerFrameReadiness::AwaitingCount { received: 0 }
        );
        state.set_expected_command_count(p(1), f(3), 2).unwrap();
        state.record_command_received(p(1), f(3)).unwrap();
        assert_eq!(
            state.player_frame_readiness(p(1), f(3)),
            PlayerFrameReadiness::AwaitingCommands {
                received: 1,
                expected: 2
            }
        );
        state.record_command_received(p(1), f(3)).unwrap();
        assert!(state.player_frame_readiness(p(1), f(3)).is_ready());

        let readiness = state.evaluate_frame_readiness(f(3));
        assert!(!readiness.players_ready);
        assert_eq!(readiness.waiting_on.as_slice(), &[p(0)]);
        state.set_expected_command_count(p(0), f(3), 0).unwrap();
        assert!(state.evaluate_frame_readiness(f(3)).can_execute());
    }

    #[test]
    fn early_command_requests_one_resend() {
        let mut state = state(2, 0);
        state.record_command_received(p(1), f(4)).unwrap();
        state.record_command_received(p(1), f(4)).unwrap();
        assert!(state.is_resend_requested(p(1), f(4)));
        let events: Vec<_> = state.events().collect();
        assert_eq!(
            events,
            vec![FrameStateEvent::ResendRequested {
                player: p(1),
                frame: f(4)
            }]
        );
        // the early commands still count
        state.set_expected_command_count(p(1), f(4), 2).unwrap();
        assert!(state.player_frame_readiness(p(1), f(4)).is_ready());
    }

    #[test]
    fn surplus_commands_flag_a_persistent_mismatch_once() {
        let observer = Arc::new(CollectingObserver::new());
        let mut state = state(2, 0).with_observer(observer.clone());
        state.set_expected_command_count(p(1), f(2), 1).unwrap();
        state.record_command_received(p(1), f(2)).unwrap();
        state.record_command_received(p(1), f(2)).unwrap();
        state.record_command_received(p(1), f(2)).unwrap();

        assert!(state.has_command_count_mismatch(p(1), f(2)));
        let mismatches = state
            .events()
            .filter(|e| matches!(e, FrameStateEvent::CommandCountMismatch { .. }))
            .count();
        assert_eq!(mismatches, 1);
        assert!(observer.has_violation(ViolationKind::FrameReadiness));
        assert_eq!(state.evaluate_frame_readiness(f(2)).mismatched.as_slice(), &[p(1)]);

        state.prune_before(f(3));
        assert!(!state.has_command_count_mismatch(p(1), f(2)));
    }

    #[test]
    fn count_lower_than_received_is_a_mismatch() {
        let mut state = state(2, 0);
        state.record_command_received(p(1), f(2)).unwrap();
        state.record_command_received(p(1), f(2)).unwrap();
        state.set_expected_command_count(p(1), f(2), 1).unwrap();
        assert!(state.has_command_count_mismatch(p(1), f(2)));
    }

    #[test]
    fn continuation_gate_blocks_execution() {
        let mut state = state(2, 0);
        let open = Rc::new(Cell::new(false));
        let gate = Rc::clone(&open);
        state.set_continuation_gate(move |_| gate.get());
        make_ready(&mut state, f(1));

        let readiness = state.evaluate_frame_execution_readiness(f(1)).unwrap();
        assert!(readiness.players_ready);
        assert!(!readiness.can_execute());
        open.set(true);
        assert!(state.evaluate_frame_execution_readiness(f(1)).unwrap().can_execute());
    }

    #[test]
    fn stall_indicator_turns_on_once_then_paces_keepalives() {
        let mut state = state(3, 0);
        let t0 = Instant::now();
        assert_eq!(state.evaluate_disconnect_stall(t0, true), StallUpdate::Waiting);
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_secs(4), true),
            StallUpdate::Waiting
        );
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_secs(5), true),
            StallUpdate::IndicatorOn
        );
        assert_eq!(state.continuation_state(), ContinuationState::ScreenOn);
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_millis(5200), true),
            StallUpdate::Stalled
        );
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_millis(5500), true),
            StallUpdate::SendKeepAlive
        );
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_millis(5600), true),
            StallUpdate::Stalled
        );
        let on_events = state
            .events()
            .filter(|e| *e == FrameStateEvent::StallIndicatorOn)
            .count();
        assert_eq!(on_events, 1);
    }

    #[test]
    fn waiting_resets_while_indicator_is_off() {
        let mut state = state(2, 0);
        let t0 = Instant::now();
        state.evaluate_disconnect_stall(t0, true);
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_secs(4), false),
            StallUpdate::NotStalled
        );
        assert_eq!(
            state.evaluate_disconnect_stall(t0 + Duration::from_secs(6), true),
            StallUpdate::Waiting
        );
    }

    #[test]
    fn ready_frame_turns_screen_off_once_and_clears_local_votes() {
        let mut state = state(3, 0);
        let t0 = Instant::now();
        state.evaluate_disconnect_stall(t0, true);
        state.evaluate_disconnect_stall(t0 + Duration::from_secs(5), true);
        state.cast_disconnect_vote(p(2), f(7), p(0)).unwrap();
        state.cast_disconnect_vote(p(2), f(8), p(0)).unwrap();
        state.cast_disconnect_vote(p(2), f(7), p(1)).unwrap();
        let _ = state.events().count();

        make_ready(&mut state, f(7));
        assert!(state.evaluate_frame_execution_readiness(f(7)).unwrap().can_execute());
        assert_eq!(state.continuation_state(), ContinuationState::ScreenOff);
        assert!(!state.is_stall_indicator_on());
        assert_eq!(state.disconnect_vote_count(p(2), f(7)), 1);
        assert_eq!(state.disconnect_vote_count(p(2), f(8)), 1);

        state.evaluate_frame_execution_readiness(f(7)).unwrap();
        let events: Vec<_> = state.events().collect();
        assert_eq!(events, vec![FrameStateEvent::DisconnectScreenOff { frame: f(7) }]);
    }

    #[test]
    fn vote_quorum_and_supersession() {
        let mut state = state(4, 0);
        assert!(state.cast_disconnect_vote(p(3), f(10), p(0)).unwrap());
        assert!(!state.is_disconnect_slot_voted_out(p(3), f(10)));
        assert!(state.cast_disconnect_vote(p(3), f(10), p(1)).unwrap());
        assert!(state.is_disconnect_slot_voted_out(p(3), f(10)));

        // a fresher disconnect frame from caster 1 withdraws its older vote
        state.record_disconnect_frame(p(1), f(11)).unwrap();
        assert!(!state.is_disconnect_slot_voted_out(p(3), f(10)));
    }

    #[test]
    fn votes_from_disconnected_players_are_ignored() {
        let observer = Arc::new(CollectingObserver::new());
        let mut state = state(3, 0).with_observer(observer.clone());
        state.disconnect_player(p(1)).unwrap();
        assert!(!state.cast_disconnect_vote(p(2), f(1), p(1)).unwrap());
        assert!(observer.has_violation(ViolationKind::Disconnect));
    }

    #[test]
    fn disconnect_frames_yield_resend_targets() {
        let mut state = state(4, 0);
        state.record_disconnect_frame(p(2), f(20)).unwrap();
        state.record_disconnect_frame(p(3), f(25)).unwrap();
        let targets = state.record_disconnect_frame(p(1), f(30)).unwrap().unwrap();
        assert_eq!(
            targets,
            vec![
                ResendTarget {
                    player: p(2),
                    from_frame: f(20)
                },
                ResendTarget {
                    player: p(3),
                    from_frame: f(25)
                },
            ]
        );
        assert_eq!(state.record_disconnect_frame(p(1), f(30)).unwrap(), None);
        assert_eq!(state.record_disconnect_frame(p(1), f(29)).unwrap(), None);
    }

    #[test]
    fn peer_without_receipt_is_a_resend_target() {
        let mut state = state(4, 0);
        state.record_disconnect_frame(p(2), f(20)).unwrap();
        let targets = state.record_disconnect_frame(p(1), f(30)).unwrap().unwrap();
        assert_eq!(
            targets,
            vec![
                ResendTarget {
                    player: p(2),
                    from_frame: f(20)
                },
                ResendTarget {
                    player: p(3),
                    from_frame: f(0)
                },
            ]
        );
    }

    #[test]
    fn translated_vote_above_local_slot_targets_next_player() {
        let mut state = state(4, 1);
        assert_eq!(state.translated_slot(p(2)), Some(1));
        assert_eq!(state.translated_slot(p(1)), None);

        // the local disconnect screen lists slots 0, 2, 3; index 1 is player 2
        assert!(state.cast_translated_disconnect_vote(1, f(5), p(1)).unwrap());
        assert_eq!(state.disconnect_vote_count(p(2), f(5)), 1);
        assert_eq!(state.disconnect_vote_count(p(1), f(5)), 0);
    }

    #[test]
    fn wire_votes_are_translated_relative_to_the_sender() {
        let mut state = state(4, 1);
        let now = Instant::now();
        let vote = |sender: u8, slot: u8| {
            NetCommand::new(
                CommandHeader {
                    frame: 5,
                    player_id: sender,
                    relay: 0,
                    command_id: None,
                },
                CommandBody::DisconnectVote {
                    slot,
                    vote_frame: 5,
                },
            )
        };

        assert_eq!(
            state.apply_disconnect_command(&vote(0, 1), now).unwrap(),
            DisconnectCommandOutcome::Vote {
                candidate: p(2),
                counted: true
            }
        );
        assert_eq!(
            state.apply_disconnect_command(&vote(3, 1), now).unwrap(),
            DisconnectCommandOutcome::Vote {
                candidate: p(1),
                counted: true
            }
        );
        assert!(matches!(
            state.apply_disconnect_command(&vote(0, 3), now),
            Err(LockstepError::InvalidPlayer { .. })
        ));
    }

    #[test]
    fn only_the_router_disconnects_players() {
        let observer = Arc::new(CollectingObserver::new());
        let mut state = state(4, 1).with_observer(observer.clone());
        let now = Instant::now();
        let order = |sender: u8| {
            NetCommand::new(
                CommandHeader {
                    frame: 9,
                    player_id: sender,
                    relay: 0,
                    command_id: None,
                },
                CommandBody::DisconnectPlayer {
                    slot: 2,
                    disconnect_frame: 9,
                },
            )
        };

        assert_eq!(
            state.apply_disconnect_command(&order(3), now).unwrap(),
            DisconnectCommandOutcome::Ignored
        );
        assert!(observer.has_violation(ViolationKind::Disconnect));
        assert!(state.is_connected(p(3)));

        // router 0: translated 2 is absolute 3
        assert_eq!(
            state.apply_disconnect_command(&order(0), now).unwrap(),
            DisconnectCommandOutcome::PlayerDisconnected { player: p(3) }
        );
        assert!(!state.is_connected(p(3)));
    }

    #[test]
    fn screen_off_clears_only_a_matching_receipt() {
        let mut state = state(3, 0);
        state.record_disconnect_frame(p(1), f(9)).unwrap();
        assert!(!state.record_disconnect_screen_off(p(1), f(8)).unwrap());
        assert_eq!(state.disconnect_frame(p(1)), Some(f(9)));
        assert!(state.record_disconnect_screen_off(p(1), f(9)).unwrap());
        assert_eq!(state.disconnect_frame(p(1)), None);
    }

    #[test]
    fn packet_router_reelection_is_reported() {
        let mut state = state(3, 1);
        state.set_packet_router_order(vec![p(0), p(1), p(2)]).unwrap();
        let t0 = Instant::now();
        assert!(matches!(
            state.evaluate_wait_for_packet_router(t0),
            PacketRouterWait::Waiting { .. }
        ));
        assert_eq!(
            state.evaluate_wait_for_packet_router(t0 + Duration::from_secs(10)),
            PacketRouterWait::Reelected {
                previous: p(0),
                next: p(1)
            }
        );
        assert_eq!(state.packet_router(), Some(p(1)));
        assert_eq!(
            state.events().collect::<Vec<_>>(),
            vec![FrameStateEvent::PacketRouterReelected {
                previous: p(0),
                next: p(1)
            }]
        );
    }

    #[test]
    fn disconnect_status_requires_agreement_and_router() {
        let mut state = state(3, 0);
        let t0 = Instant::now();
        state.evaluate_disconnect_stall(t0, true);
        state.evaluate_disconnect_stall(t0 + Duration::from_secs(5), true);
        state.record_player_keepalive(p(1), t0 + Duration::from_secs(20)).unwrap();
        let later = t0 + Duration::from_secs(31);

        let status = state.evaluate_disconnect_status(later);
        assert!(status.local_is_packet_router);
        assert_eq!(status.timed_out.as_slice(), &[p(2)]);
        assert!(!status.all_on_same_frame);
        assert!(status.players_to_disconnect.is_empty());

        for player in [0, 1, 2] {
            state.record_disconnect_frame(p(player), f(40)).unwrap();
        }
        let status = state.evaluate_disconnect_status(later);
        assert!(status.all_on_same_frame);
        assert_eq!(status.players_to_disconnect.as_slice(), &[p(2)]);

        state.disconnect_player(p(2)).unwrap();
        let status = state.evaluate_disconnect_status(later);
        assert!(status.players_to_disconnect.is_empty());
    }

    #[test]
    fn non_router_never_decides() {
        let mut state = state(3, 2);
        for player in [0, 1, 2] {
            state.record_disconnect_frame(p(player), f(5)).unwrap();
        }
        state.cast_disconnect_vote(p(1), f(5), p(0)).unwrap();
        state.cast_disconnect_vote(p(1), f(5), p(2)).unwrap();
        let status = state.evaluate_disconnect_status(Instant::now());
        assert_eq!(status.voted_out.as_slice(), &[p(1)]);
        assert!(!status.local_is_packet_router);
        assert!(status.players_to_disconnect.is_empty());
    }
}
