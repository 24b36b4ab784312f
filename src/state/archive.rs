//! Bounded retention of sent commands for catch-up resends.
//!
//! The archive keeps, per `(frame, sender)`, the synchronized commands that were sent and the
//! announced command count. Commands and counts may arrive in any order and are recorded
//! independently. Only the last [`ArchiveConfig::frames_to_keep`] frames are retained.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{ensure_valid_frame, ensure_valid_player};
use crate::network::messages::{CommandBody, CommandHeader, NetCommand};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{ArchiveConfig, Frame, LockstepError, PlayerId, MAX_SLOTS};

#[derive(Debug, Clone, Default)]
struct ArchiveEntry {
    commands: Vec<NetCommand>,
    expected_count: Option<u32>,
}

/// One sender's contribution to a resent frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResendSender {
    /// The player whose commands these are.
    pub player: PlayerId,
    /// Number of commands the player issued for the frame, as announced in FRAMEINFO. Falls
    /// back to the number of archived commands when no count was recorded, and is 0 when
    /// nothing was archived.
    pub command_count: u16,
    /// The archived commands, in arrival order.
    pub commands: Vec<NetCommand>,
}

/// Everything to resend for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResendFrame {
    /// The frame.
    pub frame: Frame,
    /// One entry per connected player other than the target.
    pub senders: Vec<ResendSender>,
}

/// What a lagging or newly joined peer needs to catch up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResendPlan {
    /// The peer the plan is for.
    pub target: PlayerId,
    /// Frames in ascending order.
    pub frames: Vec<ResendFrame>,
}

impl ResendPlan {
    /// True if there is nothing to resend.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Flattens the plan into wire commands: every archived command of a sender, followed by a
    /// FRAMEINFO carrying that sender's count for the frame.
    #[must_use]
    pub fn into_commands(self) -> Vec<NetCommand> {
        let mut out = Vec::new();
        for frame in self.frames {
            for sender in frame.senders {
                out.extend(sender.commands);
                out.push(NetCommand::new(
                    CommandHeader {
                        frame: frame.frame.to_wire(),
                        player_id: sender.player.as_u8(),
                        relay: 0,
                        command_id: None,
                    },
                    CommandBody::FrameInfo {
                        command_count: sender.command_count,
                    },
                ));
            }
        }
        out
    }
}

/// Per-sender, per-frame command archive with a bounded window.
///
/// # Example
///
/// ```
/// use fortress_lockstep::{
///     ArchiveConfig, CommandBody, CommandHeader, Frame, FrameResendArchive, NetCommand, PlayerId,
/// };
///
/// let mut archive = FrameResendArchive::new(ArchiveConfig { frames_to_keep: 10 });
/// let sender = PlayerId::new(1);
/// let command = NetCommand::new(
///     CommandHeader { frame: 5, player_id: 1, relay: 0, command_id: Some(9) },
///     CommandBody::GameCommand { message_type: 1, payload: vec![] },
/// );
/// archive.record_command(sender, Frame::new(5), command).unwrap();
/// archive.set_expected_count(sender, Frame::new(5), 1).unwrap();
///
/// let plan = archive
///     .build_resend_plan(PlayerId::new(2), Frame::new(0), Frame::new(8), &[PlayerId::new(1), PlayerId::new(2)])
///     .unwrap();
/// assert_eq!(plan.frames.len(), 8);
/// assert_eq!(plan.frames[5].senders[0].command_count, 1);
/// ```
#[derive(Clone, Default)]
pub struct FrameResendArchive {
    config: ArchiveConfig,
    entries: BTreeMap<(Frame, PlayerId), ArchiveEntry>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for FrameResendArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameResendArchive")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl FrameResendArchive {
    /// Creates an empty archive.
    #[must_use]
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            violation_observer: None,
        }
    }

    /// Routes count-overflow reports to `observer` instead of the tracing fallback.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// The retention window in frames.
    #[must_use]
    pub fn frames_to_keep(&self) -> i32 {
        self.config.frames_to_keep
    }

    /// Archives a command `sender` issued for `frame`.
    pub fn record_command(
        &mut self,
        sender: PlayerId,
        frame: Frame,
        command: NetCommand,
    ) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        ensure_valid_player(sender, MAX_SLOTS)?;
        trace!("Archiving {:?} from {} for frame {}", command.command_type(), sender, frame);
        self.entries
            .entry((frame, sender))
            .or_default()
            .commands
            .push(command);
        Ok(())
    }

    /// Records how many commands `sender` issued for `frame`. The latest count wins.
    pub fn set_expected_count(
        &mut self,
        sender: PlayerId,
        frame: Frame,
        count: u32,
    ) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        ensure_valid_player(sender, MAX_SLOTS)?;
        self.entries.entry((frame, sender)).or_default().expected_count = Some(count);
        Ok(())
    }

    /// The recorded count for `(sender, frame)`.
    #[must_use]
    pub fn expected_count(&self, sender: PlayerId, frame: Frame) -> Option<u32> {
        self.entries.get(&(frame, sender))?.expected_count
    }

    /// The archived commands for `(sender, frame)`.
    #[must_use]
    pub fn commands(&self, sender: PlayerId, frame: Frame) -> &[NetCommand] {
        self.entries
            .get(&(frame, sender))
            .map(|entry| entry.commands.as_slice())
            .unwrap_or(&[])
    }

    /// Number of archived `(frame, sender)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The oldest archived frame.
    #[must_use]
    pub fn oldest_frame(&self) -> Option<Frame> {
        self.entries.keys().next().map(|(frame, _)| *frame)
    }

    /// The FRAMEINFO count for an entry. A count that does not fit the wire field is reported
    /// and sent as `u16::MAX`, which the receiver will flag as a mismatch.
    fn announced_count(&self, frame: Frame, sender: PlayerId, entry: &ArchiveEntry) -> u16 {
        let count = entry
            .expected_count
            .map_or(entry.commands.len(), |count| count as usize);
        u16::try_from(count).unwrap_or_else(|err| {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                frame,
                "player {} has {} commands for one frame, FRAMEINFO holds at most {}: {}",
                sender,
                count,
                u16::MAX,
                err
            );
            u16::MAX
        })
    }

    fn window_start(&self, current_frame: Frame) -> Frame {
        current_frame.saturating_sub(self.config.frames_to_keep)
    }

    /// Evicts every entry older than `current_frame - frames_to_keep`. Idempotent.
    pub fn prune_history(&mut self, current_frame: Frame) {
        let keep_from = self.window_start(current_frame);
        let before = self.entries.len();
        self.entries = self.entries.split_off(&(keep_from, PlayerId::new(0)));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!("Pruned {} archive entries before frame {}", evicted, keep_from);
        }
    }

    /// Builds the resend plan for `target`.
    ///
    /// Covers the frames in `[max(starting_frame, current_frame - frames_to_keep), current_frame)`.
    /// Every frame lists every player in `connected` except `target`, in ascending player order;
    /// a player with nothing archived appears with count 0 and no commands.
    pub fn build_resend_plan(
        &self,
        target: PlayerId,
        starting_frame: Frame,
        current_frame: Frame,
        connected: &[PlayerId],
    ) -> Result<ResendPlan, LockstepError> {
        ensure_valid_frame(starting_frame)?;
        ensure_valid_frame(current_frame)?;
        ensure_valid_player(target, MAX_SLOTS)?;

        let mut senders: Vec<PlayerId> = connected.iter().copied().filter(|p| *p != target).collect();
        senders.sort_unstable();
        senders.dedup();

        let first = starting_frame.max(self.window_start(current_frame));
        let mut frames = Vec::new();
        let mut frame = first;
        while frame < current_frame {
            let senders = senders
                .iter()
                .map(|player| match self.entries.get(&(frame, *player)) {
                    Some(entry) => ResendSender {
                        player: *player,
                        command_count: self.announced_count(frame, *player, entry),
                        commands: entry.commands.clone(),
                    },
                    None => ResendSender {
                        player: *player,
                        command_count: 0,
                        commands: Vec::new(),
                    },
                })
                .collect();
            frames.push(ResendFrame { frame, senders });
            frame += 1;
        }

        debug!(
            "Resend plan for player {}: frames {}..{} ({} frames)",
            target,
            first,
            current_frame,
            frames.len()
        );
        Ok(ResendPlan { target, frames })
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
    use crate::telemetry::CollectingObserver;

    fn game_command(frame: u32, player: u8, id: u16) -> NetCommand {
        NetCommand::new(
            CommandHeader {
                frame,
                player_id: player,
                relay: 0,
                command_id: Some(id),
            },
            CommandBody::GameCommand {
                message_type: 1,
                payload: vec![player],
            },
        )
    }

    fn players(ids: &[u8]) -> Vec<PlayerId> {
        ids.iter().copied().map(PlayerId::new).collect()
    }

    #[test]
    fn commands_and_counts_are_independent() {
        let mut archive = FrameResendArchive::default();
        let p1 = PlayerId::new(1);
        archive.set_expected_count(p1, Frame::new(3), 2).unwrap();
        assert!(archive.commands(p1, Frame::new(3)).is_empty());
        archive.record_command(p1, Frame::new(3), game_command(3, 1, 1)).unwrap();
        assert_eq!(archive.expected_count(p1, Frame::new(3)), Some(2));
        assert_eq!(archive.commands(p1, Frame::new(3)).len(), 1);
    }

    #[test]
    fn plan_lists_every_other_connected_player() {
        let mut archive = FrameResendArchive::default();
        archive
            .record_command(PlayerId::new(1), Frame::new(4), game_command(4, 1, 1))
            .unwrap();
        archive
            .set_expected_count(PlayerId::new(1), Frame::new(4), 1)
            .unwrap();

        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(4), Frame::new(6), &players(&[2, 0, 1]))
            .unwrap();
        assert_eq!(plan.frames.len(), 2);
        let first = &plan.frames[0];
        assert_eq!(first.frame, Frame::new(4));
        assert_eq!(
            first.senders.iter().map(|s| s.player).collect::<Vec<_>>(),
            players(&[1, 2])
        );
        assert_eq!(first.senders[0].command_count, 1);
        assert_eq!(first.senders[1].command_count, 0);
        assert!(first.senders[1].commands.is_empty());
        assert!(plan.frames.iter().all(|f| f.frame < Frame::new(6)));
    }

    #[test]
    fn plan_never_reaches_behind_the_window() {
        let archive = FrameResendArchive::new(ArchiveConfig { frames_to_keep: 5 });
        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(0), Frame::new(20), &players(&[0, 1]))
            .unwrap();
        assert_eq!(plan.frames.first().unwrap().frame, Frame::new(15));
        assert_eq!(plan.frames.last().unwrap().frame, Frame::new(19));

        let empty = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(20), Frame::new(20), &players(&[1]))
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn count_falls_back_to_archived_commands() {
        let mut archive = FrameResendArchive::default();
        let p1 = PlayerId::new(1);
        archive.record_command(p1, Frame::new(1), game_command(1, 1, 1)).unwrap();
        archive.record_command(p1, Frame::new(1), game_command(1, 1, 2)).unwrap();
        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(1), Frame::new(2), &[p1])
            .unwrap();
        assert_eq!(plan.frames[0].senders[0].command_count, 2);
    }

    #[test]
    fn oversized_count_is_reported_not_hidden() {
        let observer = Arc::new(CollectingObserver::new());
        let mut archive = FrameResendArchive::default().with_observer(observer.clone());
        let p1 = PlayerId::new(1);
        archive
            .set_expected_count(p1, Frame::new(2), u32::from(u16::MAX) + 1)
            .unwrap();

        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(2), Frame::new(3), &[p1])
            .unwrap();
        assert_eq!(plan.frames[0].senders[0].command_count, u16::MAX);
        let reports = observer.violations_of_kind(ViolationKind::InternalError);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].frame, Some(Frame::new(2)));

        let commands = plan.into_commands();
        assert!(matches!(
            commands.last().map(|c| &c.body),
            Some(CommandBody::FrameInfo { command_count: u16::MAX })
        ));
    }

    #[test]
    fn count_that_fits_is_not_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let mut archive = FrameResendArchive::default().with_observer(observer.clone());
        let p1 = PlayerId::new(1);
        archive.set_expected_count(p1, Frame::new(2), 3).unwrap();
        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(2), Frame::new(3), &[p1])
            .unwrap();
        assert_eq!(plan.frames[0].senders[0].command_count, 3);
        assert!(observer.is_empty());
    }

    #[test]
    fn prune_is_idempotent() {
        let mut archive = FrameResendArchive::new(ArchiveConfig { frames_to_keep: 3 });
        for frame in 0..10 {
            archive
                .record_command(PlayerId::new(1), Frame::new(frame), game_command(frame as u32, 1, 0))
                .unwrap();
        }
        archive.prune_history(Frame::new(10));
        assert_eq!(archive.oldest_frame(), Some(Frame::new(7)));
        assert_eq!(archive.len(), 3);
        archive.prune_history(Frame::new(10));
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn plan_flattens_to_wire_commands() {
        let mut archive = FrameResendArchive::default();
        let p1 = PlayerId::new(1);
        archive.record_command(p1, Frame::new(2), game_command(2, 1, 5)).unwrap();
        archive.set_expected_count(p1, Frame::new(2), 1).unwrap();
        let commands = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(2), Frame::new(3), &[p1])
            .unwrap()
            .into_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], game_command(2, 1, 5));
        assert_eq!(commands[1].body, CommandBody::FrameInfo { command_count: 1 });
        assert_eq!(commands[1].header.frame, 2);
        assert_eq!(commands[1].header.player_id, 1);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let mut archive = FrameResendArchive::default();
        assert!(archive
            .record_command(PlayerId::new(1), Frame::NULL, game_command(0, 1, 0))
            .is_err());
        assert!(archive
            .set_expected_count(PlayerId::new(9), Frame::new(0), 0)
            .is_err());
        assert!(archive
            .build_resend_plan(PlayerId::new(0), Frame::new(-1), Frame::new(5), &[])
            .is_err());
    }
}
