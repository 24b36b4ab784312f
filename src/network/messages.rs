//! Decoded form of the commands that travel inside packets.
//!
//! A [`NetCommand`] is a [`CommandHeader`] (frame, sender, relay mask, optional command id)
//! plus a [`CommandBody`] whose variant determines the [`NetCommandType`].

use serde::{Deserialize, Serialize};

use crate::network::wire::WireError;

/// Command type byte as it appears after the `'T'` marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum NetCommandType {
    AckBoth = 0,
    AckStage1 = 1,
    AckStage2 = 2,
    FrameInfo = 3,
    GameCommand = 4,
    PlayerLeave = 5,
    RunAheadMetrics = 6,
    RunAhead = 7,
    DestroyPlayer = 8,
    KeepAlive = 9,
    DisconnectChat = 10,
    Chat = 11,
    ManglerQuery = 12,
    ManglerResponse = 13,
    Progress = 14,
    LoadComplete = 15,
    TimeoutStart = 16,
    Wrapper = 17,
    File = 18,
    FileAnnounce = 19,
    FileProgress = 20,
    FrameResendRequest = 21,
    DisconnectStart = 22,
    DisconnectKeepAlive = 23,
    DisconnectPlayer = 24,
    PacketRouterQuery = 25,
    PacketRouterAck = 26,
    DisconnectVote = 27,
    DisconnectFrame = 28,
    DisconnectScreenOff = 29,
    DisconnectEnd = 30,
}

impl NetCommandType {
    /// Every command type, in wire order.
    pub const ALL: [NetCommandType; 31] = [
        Self::AckBoth,
        Self::AckStage1,
        Self::AckStage2,
        Self::FrameInfo,
        Self::GameCommand,
        Self::PlayerLeave,
        Self::RunAheadMetrics,
        Self::RunAhead,
        Self::DestroyPlayer,
        Self::KeepAlive,
        Self::DisconnectChat,
        Self::Chat,
        Self::ManglerQuery,
        Self::ManglerResponse,
        Self::Progress,
        Self::LoadComplete,
        Self::TimeoutStart,
        Self::Wrapper,
        Self::File,
        Self::FileAnnounce,
        Self::FileProgress,
        Self::FrameResendRequest,
        Self::DisconnectStart,
        Self::DisconnectKeepAlive,
        Self::DisconnectPlayer,
        Self::PacketRouterQuery,
        Self::PacketRouterAck,
        Self::DisconnectVote,
        Self::DisconnectFrame,
        Self::DisconnectScreenOff,
        Self::DisconnectEnd,
    ];

    /// The wire byte.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for NetCommandType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(WireError::UnknownCommandType { value })
    }
}

/// Header fields carried by the `'F'`, `'P'`, `'R'` and `'C'` markers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    /// Execution frame of the command.
    pub frame: u32,
    /// Slot of the sender.
    pub player_id: u8,
    /// Relay mask. Decoded and re-encoded, never interpreted here.
    pub relay: u8,
    /// Command id, present for command types that need one.
    pub command_id: Option<u16>,
}

/// One byte range of a larger wrapped payload.
///
/// Encoded as a 22-byte little-endian envelope followed by `data_length` bytes.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WrapperChunk {
    /// Transient id grouping the chunks of one wrapped command.
    pub wrapped_command_id: u16,
    /// Index of this chunk.
    pub chunk_number: u32,
    /// Number of chunks the sender split the payload into.
    pub num_chunks: u32,
    /// Length of the complete payload.
    pub total_data_length: u32,
    /// Length of `data`.
    pub data_length: u32,
    /// Offset of `data` inside the complete payload.
    pub data_offset: u32,
    /// The bytes of this range.
    pub data: Vec<u8>,
}

/// Size of the fixed part of the wrapper envelope.
pub const WRAPPER_ENVELOPE_LEN: usize = 22;

impl std::fmt::Debug for WrapperChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            wrapped_command_id,
            chunk_number,
            num_chunks,
            total_data_length,
            data_length,
            data_offset,
            data,
        } = self;

        f.debug_struct("WrapperChunk")
            .field("wrapped_command_id", wrapped_command_id)
            .field("chunk_number", chunk_number)
            .field("num_chunks", num_chunks)
            .field("total_data_length", total_data_length)
            .field("data_length", data_length)
            .field("data_offset", data_offset)
            .field("data", &BytesDebug(data))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Type-specific payload of a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CommandBody {
    AckBoth {
        command_id: u16,
        original_player: u8,
    },
    AckStage1 {
        command_id: u16,
        original_player: u8,
    },
    AckStage2 {
        command_id: u16,
        original_player: u8,
    },
    /// Announces how many commands the sender issued for the header's frame.
    FrameInfo {
        command_count: u16,
    },
    /// A simulation command. The payload is opaque to this crate.
    GameCommand {
        message_type: u32,
        payload: Vec<u8>,
    },
    PlayerLeave {
        leaving_player: u8,
    },
    RunAheadMetrics {
        average_latency: f32,
        average_fps: u16,
    },
    RunAhead {
        run_ahead: u16,
        frame_rate: u8,
    },
    DestroyPlayer {
        player_index: u32,
    },
    KeepAlive,
    DisconnectChat {
        text: String,
    },
    Chat {
        text: String,
        player_mask: i32,
    },
    ManglerQuery,
    ManglerResponse,
    Progress {
        percentage: u8,
    },
    LoadComplete,
    TimeoutStart,
    Wrapper(WrapperChunk),
    File {
        path: String,
        data: Vec<u8>,
    },
    FileAnnounce {
        path: String,
        file_id: u16,
        player_mask: u8,
    },
    FileProgress {
        file_id: u16,
        progress: i32,
    },
    FrameResendRequest {
        frame_to_resend: u32,
    },
    DisconnectStart,
    DisconnectKeepAlive,
    DisconnectPlayer {
        slot: u8,
        disconnect_frame: u32,
    },
    PacketRouterQuery,
    PacketRouterAck,
    DisconnectVote {
        slot: u8,
        vote_frame: u32,
    },
    DisconnectFrame {
        disconnect_frame: u32,
    },
    DisconnectScreenOff {
        new_frame: u32,
    },
    DisconnectEnd,
}

impl CommandBody {
    /// The command type this body belongs to.
    #[must_use]
    pub const fn command_type(&self) -> NetCommandType {
        match self {
            Self::AckBoth { .. } => NetCommandType::AckBoth,
            Self::AckStage1 { .. } => NetCommandType::AckStage1,
            Self::AckStage2 { .. } => NetCommandType::AckStage2,
            Self::FrameInfo { .. } => NetCommandType::FrameInfo,
            Self::GameCommand { .. } => NetCommandType::GameCommand,
            Self::PlayerLeave { .. } => NetCommandType::PlayerLeave,
            Self::RunAheadMetrics { .. } => NetCommandType::RunAheadMetrics,
            Self::RunAhead { .. } => NetCommandType::RunAhead,
            Self::DestroyPlayer { .. } => NetCommandType::DestroyPlayer,
            Self::KeepAlive => NetCommandType::KeepAlive,
            Self::DisconnectChat { .. } => NetCommandType::DisconnectChat,
            Self::Chat { .. } => NetCommandType::Chat,
            Self::ManglerQuery => NetCommandType::ManglerQuery,
            Self::ManglerResponse => NetCommandType::ManglerResponse,
            Self::Progress { .. } => NetCommandType::Progress,
            Self::LoadComplete => NetCommandType::LoadComplete,
            Self::TimeoutStart => NetCommandType::TimeoutStart,
            Self::Wrapper(_) => NetCommandType::Wrapper,
            Self::File { .. } => NetCommandType::File,
            Self::FileAnnounce { .. } => NetCommandType::FileAnnounce,
            Self::FileProgress { .. } => NetCommandType::FileProgress,
            Self::FrameResendRequest { .. } => NetCommandType::FrameResendRequest,
            Self::DisconnectStart => NetCommandType::DisconnectStart,
            Self::DisconnectKeepAlive => NetCommandType::DisconnectKeepAlive,
            Self::DisconnectPlayer { .. } => NetCommandType::DisconnectPlayer,
            Self::PacketRouterQuery => NetCommandType::PacketRouterQuery,
            Self::PacketRouterAck => NetCommandType::PacketRouterAck,
            Self::DisconnectVote { .. } => NetCommandType::DisconnectVote,
            Self::DisconnectFrame { .. } => NetCommandType::DisconnectFrame,
            Self::DisconnectScreenOff { .. } => NetCommandType::DisconnectScreenOff,
            Self::DisconnectEnd => NetCommandType::DisconnectEnd,
        }
    }
}

/// A fully decoded command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetCommand {
    /// Marker-carried header fields.
    pub header: CommandHeader,
    /// Type-specific payload.
    pub body: CommandBody,
}

impl NetCommand {
    /// Creates a command.
    #[must_use]
    pub fn new(header: CommandHeader, body: CommandBody) -> Self {
        Self { header, body }
    }

    /// The type of this command, derived from its body.
    #[must_use]
    pub const fn command_type(&self) -> NetCommandType {
        self.body.command_type()
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
    fn command_type_table_matches_discriminants() {
        for (index, ty) in NetCommandType::ALL.iter().enumerate() {
            assert_eq!(usize::from(ty.as_u8()), index);
            assert_eq!(NetCommandType::try_from(ty.as_u8()).unwrap(), *ty);
        }
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        assert_eq!(
            NetCommandType::try_from(31),
            Err(WireError::UnknownCommandType { value: 31 })
        );
        assert!(NetCommandType::try_from(0xff).is_err());
    }

    #[test]
    fn body_reports_its_type() {
        let command = NetCommand::new(
            CommandHeader::default(),
            CommandBody::DisconnectVote {
                slot: 2,
                vote_frame: 40,
            },
        );
        assert_eq!(command.command_type(), NetCommandType::DisconnectVote);
        assert_eq!(
            CommandBody::Wrapper(WrapperChunk::default()).command_type(),
            NetCommandType::Wrapper
        );
    }

    #[test]
    fn wrapper_debug_prints_hex_data() {
        let chunk = WrapperChunk {
            data: vec![0xde, 0xad],
            data_length: 2,
            ..WrapperChunk::default()
        };
        let debug = format!("{:?}", chunk);
        assert!(debug.contains("0xdead"));
    }
}
