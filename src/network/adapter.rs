//! Normalization of incoming commands into the canonical [`Command`] shape.
//!
//! Two sources feed the kernel:
//!
//! - Decoded GAMECOMMAND wire commands, converted with [`command_from_wire`].
//! - Structured messages from older transports, whose field names changed over time. They
//!   deserialize into [`RawCommand`], which accepts every historical name.
//!
//! The accepted names are compatibility data. Add new aliases to [`RawCommand`]; never branch on
//! field names anywhere else.

use serde::{Deserialize, Serialize};

use crate::frame_info::Command;
use crate::network::messages::{CommandBody, NetCommand};
use crate::{CommandIdConfig, LockstepError, PlayerId};

/// A command as delivered by a structured transport.
///
/// # Accepted field names
///
/// | Field | Aliases |
/// |-------|---------|
/// | `command_type` | `commandType`, `type`, `msgType`, `message_type` |
/// | `player_id` | `playerId`, `player`, `playerIndex`, `sender` |
/// | `sort_number` | `sortNumber`, `sort`, `seq`, `sequence` |
/// | `payload` | `data`, `bytes` |
/// | `dedupe_key` | `dedupeKey`, `key` |
///
/// ```
/// # #[cfg(feature = "json")]
/// # {
/// use fortress_lockstep::network::adapter::RawCommand;
///
/// let raw: RawCommand =
///     serde_json::from_str(r#"{"msgType": 2, "playerIndex": 1, "seq": 7}"#).unwrap();
/// let command = raw.into_command().unwrap();
/// assert_eq!(command.sort_key().2, 7);
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
    /// The command type.
    #[serde(alias = "commandType", alias = "type", alias = "msgType", alias = "message_type")]
    pub command_type: u32,
    /// The issuing player's slot. Wider than a byte so out-of-range values can be reported.
    #[serde(alias = "playerId", alias = "player", alias = "playerIndex", alias = "sender")]
    pub player_id: u32,
    /// Tie breaker within `(command_type, player_id)`.
    #[serde(default, alias = "sortNumber", alias = "sort", alias = "seq", alias = "sequence")]
    pub sort_number: u32,
    /// Opaque command payload.
    #[serde(default, alias = "data", alias = "bytes")]
    pub payload: Vec<u8>,
    /// Idempotency key.
    #[serde(default, alias = "dedupeKey", alias = "key")]
    pub dedupe_key: Option<String>,
}

impl RawCommand {
    /// Converts into the canonical shape. Fails if the player id does not fit a slot.
    pub fn into_command(self) -> Result<Command, LockstepError> {
        let player = u8::try_from(self.player_id).map_err(|err| LockstepError::InvalidRequest {
            info: format!("player id {} does not fit in a slot: {}", self.player_id, err),
        })?;
        let command = Command::new(
            self.command_type,
            PlayerId::new(player),
            self.sort_number,
            self.payload,
        );
        Ok(match self.dedupe_key {
            Some(key) => command.with_dedupe_key(key),
            None => command,
        })
    }
}

impl TryFrom<RawCommand> for Command {
    type Error = LockstepError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        raw.into_command()
    }
}

/// Converts a decoded GAMECOMMAND into a canonical [`Command`], assuming ids were issued from
/// the default [`CommandIdConfig`] seed. See [`command_from_wire_seeded`].
#[must_use]
pub fn command_from_wire(command: &NetCommand) -> Option<Command> {
    command_from_wire_seeded(command, CommandIdConfig::default().seed)
}

/// Sort number for a command id issued by a sequencer seeded with `seed`.
///
/// Ids wrap from 65535 to 0, so the raw id would sort commands issued across the wrap before
/// older ones. The distance from the seed keeps issue order for the first 65535 ids a sender
/// issues; only after that does the key wrap.
#[must_use]
pub const fn command_sort_number(command_id: u16, seed: u16) -> u32 {
    command_id.wrapping_sub(seed) as u32
}

/// Converts a decoded GAMECOMMAND into a canonical [`Command`].
///
/// The message type becomes the command type and [`command_sort_number`] of the command id the
/// sort number (0 if absent). Every peer of a match must pass the same `seed`. Commands that
/// carry an id get the dedupe key `"{player}:{frame}:{command_id}"`, so a resent copy is
/// enqueued only once. Any other command type yields `None`.
#[must_use]
pub fn command_from_wire_seeded(command: &NetCommand, seed: u16) -> Option<Command> {
    let CommandBody::GameCommand {
        message_type,
        payload,
    } = &command.body
    else {
        return None;
    };
    let header = &command.header;
    let converted = Command::new(
        *message_type,
        PlayerId::new(header.player_id),
        header.command_id.map_or(0, |id| command_sort_number(id, seed)),
        payload.clone(),
    );
    Some(match header.command_id {
        Some(id) => converted.with_dedupe_key(format!("{}:{}:{}", header.player_id, header.frame, id)),
        None => converted,
    })
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
    use crate::network::messages::CommandHeader;
    use crate::CommandIdSequencer;

    fn game_command(command_id: Option<u16>) -> NetCommand {
        NetCommand::new(
            CommandHeader {
                frame: 12,
                player_id: 3,
                relay: 0,
                command_id,
            },
            CommandBody::GameCommand {
                message_type: 1049,
                payload: vec![1, 2, 3],
            },
        )
    }

    #[test]
    fn wire_game_command_becomes_canonical() {
        let command = command_from_wire(&game_command(Some(65001))).unwrap();
        assert_eq!(command.sort_key(), (1049, PlayerId::new(3), 1001));
        assert_eq!(command.payload, vec![1, 2, 3]);
        assert_eq!(command.dedupe_key.as_deref(), Some("3:12:65001"));
    }

    #[test]
    fn ids_issued_across_the_wrap_keep_issue_order() {
        let mut ids = CommandIdSequencer::new(CommandIdConfig {
            seed: 65530,
            ..CommandIdConfig::default()
        });
        let mut keys = Vec::new();
        for _ in 0..12 {
            let id = ids.next_command_id().unwrap();
            let command = command_from_wire_seeded(&game_command(Some(id)), 65530).unwrap();
            keys.push(command.sort_number);
        }
        // ids run 65531..=65535 then 0..=6
        assert_eq!(keys, (1..=12).collect::<Vec<u32>>());
    }

    #[test]
    fn wire_game_command_without_id_has_no_key() {
        let command = command_from_wire(&game_command(None)).unwrap();
        assert_eq!(command.sort_number, 0);
        assert_eq!(command.dedupe_key, None);
    }

    #[test]
    fn other_wire_commands_are_not_converted() {
        let keepalive = NetCommand::new(CommandHeader::default(), CommandBody::KeepAlive);
        assert!(command_from_wire(&keepalive).is_none());
    }

    #[test]
    fn historical_field_names_are_accepted() {
        let variants = [
            r#"{"command_type": 4, "player_id": 1, "sort_number": 9, "payload": [7], "dedupe_key": "k"}"#,
            r#"{"commandType": 4, "playerId": 1, "sortNumber": 9, "data": [7], "dedupeKey": "k"}"#,
            r#"{"type": 4, "player": 1, "sort": 9, "bytes": [7], "key": "k"}"#,
            r#"{"msgType": 4, "sender": 1, "sequence": 9, "payload": [7], "key": "k"}"#,
        ];
        for json in variants {
            let raw: RawCommand = serde_json::from_str(json).unwrap();
            let command = Command::try_from(raw).unwrap();
            assert_eq!(command.sort_key(), (4, PlayerId::new(1), 9), "{json}");
            assert_eq!(command.payload, vec![7]);
            assert_eq!(command.dedupe_key.as_deref(), Some("k"));
        }
    }

    #[test]
    fn optional_fields_default() {
        let raw: RawCommand = serde_json::from_str(r#"{"type": 2, "player": 0}"#).unwrap();
        let command = raw.into_command().unwrap();
        assert_eq!(command.sort_number, 0);
        assert!(command.payload.is_empty());
        assert!(command.dedupe_key.is_none());
    }

    #[test]
    fn out_of_range_player_is_rejected() {
        let raw: RawCommand = serde_json::from_str(r#"{"type": 2, "player": 300}"#).unwrap();
        assert!(matches!(
            raw.into_command(),
            Err(LockstepError::InvalidRequest { .. })
        ));
    }
}
