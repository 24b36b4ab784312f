use serde::{Deserialize, Serialize};

use crate::{Frame, ObjectId, PlayerId};

/// A synchronized command in canonical form.
///
/// Commands are totally ordered by `(command_type, player_id, sort_number)`; `dedupe_key`
/// makes insertion into a command queue idempotent. The payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Simulation-level command type (not the wire [`NetCommandType`](crate::NetCommandType)).
    pub command_type: u32,
    /// The issuing player.
    pub player_id: PlayerId,
    /// Tie-breaker between commands of one type from one player.
    pub sort_number: u32,
    /// Opaque simulation payload.
    pub payload: Vec<u8>,
    /// Identity used to drop duplicates.
    pub dedupe_key: Option<String>,
}

impl Command {
    /// Creates a command without a dedupe key.
    #[must_use]
    pub fn new(command_type: u32, player_id: PlayerId, sort_number: u32, payload: Vec<u8>) -> Self {
        Self {
            command_type,
            player_id,
            sort_number,
            payload,
            dedupe_key: None,
        }
    }

    /// Sets the dedupe key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// The total-order key.
    #[inline]
    #[must_use]
    pub fn sort_key(&self) -> (u32, PlayerId, u32) {
        (self.command_type, self.player_id, self.sort_number)
    }
}

/// The immutable input to a frame hash or GameLogic CRC.
///
/// # Note
///
/// `commands` are hashed in the order given here; they are never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    /// The frame the snapshot describes.
    pub frame: Frame,
    /// The object id the allocator will hand out next.
    pub next_object_id: ObjectId,
    /// Digest of the simulation's random generator state.
    pub random_seed_crc: u32,
    /// Commands executed on the frame.
    pub commands: Vec<Command>,
}

impl FrameSnapshot {
    /// Creates a snapshot with no commands.
    #[must_use]
    pub fn new(frame: Frame, next_object_id: ObjectId, random_seed_crc: u32) -> Self {
        Self {
            frame,
            next_object_id,
            random_seed_crc,
            commands: Vec::new(),
        }
    }

    /// Replaces the commands.
    #[must_use]
    pub fn with_commands(mut self, commands: Vec<Command>) -> Self {
        self.commands = commands;
        self
    }
}

// #########
// # TESTS #
// #########

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
    fn sort_key_orders_by_type_then_player_then_sort_number() {
        let a = Command::new(2, PlayerId::new(3), 10, vec![]);
        let b = Command::new(2, PlayerId::new(2), 99, vec![]);
        let c = Command::new(1, PlayerId::new(7), 0, vec![]);
        let mut keys = vec![a.sort_key(), b.sort_key(), c.sort_key()];
        keys.sort();
        assert_eq!(keys, vec![c.sort_key(), b.sort_key(), a.sort_key()]);
    }

    #[test]
    fn builders() {
        let command = Command::new(4, PlayerId::new(1), 40, vec![1]).with_dedupe_key("k");
        assert_eq!(command.dedupe_key.as_deref(), Some("k"));

        let snapshot = FrameSnapshot::new(Frame::new(3), ObjectId::new(10), 0xfeed)
            .with_commands(vec![command.clone()]);
        assert_eq!(snapshot.commands, vec![command]);
    }
}
