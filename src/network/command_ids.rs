//! Command-type delivery requirements and command-id issuing.
//!
//! Every command type has a fixed set of delivery requirements. Only synchronized commands are
//! ordered per frame by the kernel; everything else (chat, file transfer, progress, keepalives)
//! bypasses ordering.
//!
//! Command ids are 16-bit and wrap. They are compared with [`sequence_greater_than`], which is
//! only meaningful while fewer than half the id space separates the compared ids, so the number
//! of ids awaiting acknowledgement is bounded by [`CommandIdConfig::max_outstanding`].

use std::collections::BTreeSet;

use tracing::trace;

use crate::network::messages::NetCommandType;
use crate::{CommandIdConfig, LockstepError};

/// Delivery requirements of a command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandRequirements {
    /// The command carries a `'C'` command id.
    pub needs_command_id: bool,
    /// The receiver must acknowledge the command.
    pub needs_ack: bool,
    /// The command goes straight to its recipients instead of through the packet router.
    pub direct_send: bool,
    /// The command executes on a frame and takes part in per-frame ordering and counting.
    pub is_synchronized: bool,
}

impl CommandRequirements {
    /// Requirements of `command_type`.
    #[must_use]
    pub const fn of(command_type: NetCommandType) -> Self {
        use NetCommandType as T;

        let is_synchronized = matches!(
            command_type,
            T::GameCommand | T::FrameInfo | T::PlayerLeave | T::DestroyPlayer | T::RunAhead
        );
        let needs_ack = matches!(
            command_type,
            T::GameCommand
                | T::FrameInfo
                | T::PlayerLeave
                | T::DestroyPlayer
                | T::RunAheadMetrics
                | T::RunAhead
                | T::Chat
                | T::DisconnectVote
                | T::LoadComplete
                | T::TimeoutStart
                | T::Wrapper
                | T::File
                | T::FileAnnounce
                | T::FileProgress
                | T::DisconnectPlayer
                | T::DisconnectFrame
                | T::DisconnectScreenOff
                | T::FrameResendRequest
        );
        let direct_send = matches!(
            command_type,
            T::AckBoth
                | T::AckStage1
                | T::AckStage2
                | T::KeepAlive
                | T::DisconnectKeepAlive
                | T::DisconnectStart
                | T::DisconnectPlayer
                | T::DisconnectVote
                | T::DisconnectFrame
                | T::DisconnectScreenOff
                | T::DisconnectEnd
                | T::DisconnectChat
                | T::PacketRouterQuery
                | T::PacketRouterAck
                | T::LoadComplete
                | T::TimeoutStart
                | T::Progress
                | T::File
                | T::FileAnnounce
                | T::FileProgress
                | T::ManglerQuery
                | T::ManglerResponse
        );

        Self {
            // Every acknowledged command is acknowledged by id.
            needs_command_id: needs_ack,
            needs_ack,
            direct_send,
            is_synchronized,
        }
    }
}

/// Returns `true` if `s1` is newer than `s2`, accounting for wraparound.
///
/// ```
/// use fortress_lockstep::network::command_ids::sequence_greater_than;
///
/// assert!(sequence_greater_than(2, 1));
/// assert!(!sequence_greater_than(1, 1));
/// assert!(sequence_greater_than(0, u16::MAX));
/// ```
#[must_use]
pub const fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Returns `true` if `s1` is older than `s2`, accounting for wraparound.
#[must_use]
pub const fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Issues command ids and tracks which of them still await an acknowledgement.
///
/// # Example
///
/// ```
/// use fortress_lockstep::{CommandIdSequencer, NetCommandType};
///
/// let mut ids = CommandIdSequencer::default();
/// let id = ids.issue_for(NetCommandType::GameCommand).unwrap().unwrap();
/// assert_eq!(id, 64001);
/// assert!(ids.is_outstanding(id));
///
/// // keepalives carry no id
/// assert_eq!(ids.issue_for(NetCommandType::KeepAlive).unwrap(), None);
///
/// assert!(ids.acknowledge(id));
/// assert_eq!(ids.outstanding_len(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct CommandIdSequencer {
    config: CommandIdConfig,
    last_issued: u16,
    outstanding: BTreeSet<u16>,
}

impl Default for CommandIdSequencer {
    fn default() -> Self {
        Self::new(CommandIdConfig::default())
    }
}

impl CommandIdSequencer {
    /// Creates a sequencer. The first id issued is `config.seed + 1`.
    #[must_use]
    pub fn new(config: CommandIdConfig) -> Self {
        Self {
            config,
            last_issued: config.seed,
            outstanding: BTreeSet::new(),
        }
    }

    /// The most recently issued id (the seed before the first issue).
    #[must_use]
    pub fn last_issued(&self) -> u16 {
        self.last_issued
    }

    /// Issues the next id, wrapping from 65535 to 0.
    ///
    /// Fails with [`LockstepError::CommandIdWindowFull`] if the next id is still awaiting an
    /// acknowledgement from a previous lap of the id space.
    pub fn next_command_id(&mut self) -> Result<u16, LockstepError> {
        let candidate = self.last_issued.wrapping_add(1);
        if self.outstanding.contains(&candidate) {
            return Err(LockstepError::CommandIdWindowFull {
                outstanding: self.outstanding.len(),
            });
        }
        self.last_issued = candidate;
        Ok(candidate)
    }

    /// Issues an id for a command of `command_type` if it needs one, and tracks it for
    /// acknowledgement if it needs one.
    pub fn issue_for(&mut self, command_type: NetCommandType) -> Result<Option<u16>, LockstepError> {
        let requirements = CommandRequirements::of(command_type);
        if !requirements.needs_command_id {
            return Ok(None);
        }
        if requirements.needs_ack {
            self.ensure_window_has_room()?;
        }
        let id = self.next_command_id()?;
        if requirements.needs_ack {
            self.outstanding.insert(id);
        }
        trace!("Issued command id {} for {:?}", id, command_type);
        Ok(Some(id))
    }

    /// Starts waiting for an acknowledgement of `id`.
    ///
    /// Tracking an id twice is a no-op.
    pub fn track_pending_ack(&mut self, id: u16) -> Result<(), LockstepError> {
        if self.outstanding.contains(&id) {
            return Ok(());
        }
        self.ensure_window_has_room()?;
        self.outstanding.insert(id);
        Ok(())
    }

    /// Records an acknowledgement. Returns `false` for ids that were not outstanding.
    pub fn acknowledge(&mut self, id: u16) -> bool {
        self.outstanding.remove(&id)
    }

    /// True if `id` awaits an acknowledgement.
    #[must_use]
    pub fn is_outstanding(&self, id: u16) -> bool {
        self.outstanding.contains(&id)
    }

    /// Number of ids awaiting an acknowledgement.
    #[must_use]
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// The outstanding id issued longest ago, judged relative to the last issued id.
    #[must_use]
    pub fn oldest_outstanding(&self) -> Option<u16> {
        self.outstanding
            .iter()
            .copied()
            .max_by_key(|id| self.last_issued.wrapping_sub(*id))
    }

    fn ensure_window_has_room(&self) -> Result<(), LockstepError> {
        if self.outstanding.len() >= self.config.max_outstanding {
            return Err(LockstepError::CommandIdWindowFull {
                outstanding: self.outstanding.len(),
            });
        }
        Ok(())
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

    #[test]
    fn synchronized_types() {
        let synchronized: Vec<NetCommandType> = NetCommandType::ALL
            .iter()
            .copied()
            .filter(|t| CommandRequirements::of(*t).is_synchronized)
            .collect();
        assert_eq!(
            synchronized,
            vec![
                NetCommandType::FrameInfo,
                NetCommandType::GameCommand,
                NetCommandType::PlayerLeave,
                NetCommandType::RunAhead,
                NetCommandType::DestroyPlayer,
            ]
        );
    }

    #[test]
    fn synchronized_commands_are_acknowledged() {
        for ty in NetCommandType::ALL {
            let req = CommandRequirements::of(ty);
            if req.is_synchronized {
                assert!(req.needs_ack && req.needs_command_id, "{ty:?}");
            }
            assert_eq!(req.needs_ack, req.needs_command_id, "{ty:?}");
        }
    }

    #[test]
    fn control_traffic_is_direct() {
        for ty in [
            NetCommandType::AckBoth,
            NetCommandType::KeepAlive,
            NetCommandType::DisconnectVote,
            NetCommandType::PacketRouterQuery,
            NetCommandType::File,
            NetCommandType::ManglerQuery,
        ] {
            assert!(CommandRequirements::of(ty).direct_send, "{ty:?}");
        }
        assert!(!CommandRequirements::of(NetCommandType::GameCommand).direct_send);
        assert!(!CommandRequirements::of(NetCommandType::Chat).direct_send);
        assert_eq!(
            CommandRequirements::of(NetCommandType::KeepAlive),
            CommandRequirements::default()
        );
    }

    #[test]
    fn wrapping_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(1, 1));
        assert!(sequence_greater_than(5, 65530));
        assert!(sequence_less_than(65530, 5));
    }

    #[test]
    fn ids_start_after_seed_and_wrap() {
        let mut ids = CommandIdSequencer::new(CommandIdConfig {
            seed: u16::MAX - 1,
            ..CommandIdConfig::default()
        });
        assert_eq!(ids.next_command_id().unwrap(), u16::MAX);
        assert_eq!(ids.next_command_id().unwrap(), 0);
        assert_eq!(ids.next_command_id().unwrap(), 1);
    }

    #[test]
    fn window_is_bounded() {
        let mut ids = CommandIdSequencer::new(CommandIdConfig {
            seed: 0,
            max_outstanding: 2,
        });
        ids.issue_for(NetCommandType::GameCommand).unwrap();
        ids.issue_for(NetCommandType::FrameInfo).unwrap();
        assert_eq!(
            ids.issue_for(NetCommandType::GameCommand),
            Err(LockstepError::CommandIdWindowFull { outstanding: 2 })
        );
        // a refused issue does not consume an id
        assert_eq!(ids.last_issued(), 2);
        assert!(ids.acknowledge(1));
        assert_eq!(ids.issue_for(NetCommandType::GameCommand).unwrap(), Some(3));
    }

    #[test]
    fn lapped_outstanding_id_is_not_reissued() {
        let mut ids = CommandIdSequencer::new(CommandIdConfig {
            seed: 9,
            max_outstanding: 1,
        });
        ids.track_pending_ack(10).unwrap();
        assert!(ids.next_command_id().is_err());
        ids.acknowledge(10);
        assert_eq!(ids.next_command_id().unwrap(), 10);
    }

    #[test]
    fn oldest_outstanding_respects_wraparound() {
        let mut ids = CommandIdSequencer::new(CommandIdConfig {
            seed: u16::MAX - 1,
            ..CommandIdConfig::default()
        });
        let first = ids.issue_for(NetCommandType::Chat).unwrap().unwrap();
        let second = ids.issue_for(NetCommandType::Chat).unwrap().unwrap();
        assert_eq!((first, second), (u16::MAX, 0));
        assert_eq!(ids.oldest_outstanding(), Some(u16::MAX));
        assert!(!ids.acknowledge(77));
    }
}
