//! Encoding and decoding of wrapped commands.
//!
//! Two formats live here:
//!
//! - The **marker stream**: a run of single-byte tags (`'T'` type, `'F'` frame, `'P'` sender,
//!   `'R'` relay, `'C'` command id) terminated by `'D'`, followed by a body whose layout is fixed
//!   by the command type. All integers are little-endian.
//! - The **wrapper-chunk envelope**: a 22-byte header describing one byte range of a larger
//!   payload, followed by that range.
//!
//! Decoding is all-or-nothing. A truncated read, an unknown marker or type, or leftover bytes
//! make the public decode functions return `None`; the caller drops the packet.
//!
//! A bincode helper pair ([`encode`] / [`decode`]) is kept for the serde-based values that are
//! hashed or persisted (see [`CrcAccumulator::add_serialized`](crate::CrcAccumulator::add_serialized)).
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::{decode_command, encode_command, CommandBody, CommandHeader, NetCommand};
//!
//! let command = NetCommand::new(
//!     CommandHeader { frame: 12, player_id: 1, relay: 0, command_id: Some(64001) },
//!     CommandBody::FrameInfo { command_count: 3 },
//! );
//! let bytes = encode_command(&command).unwrap();
//! assert_eq!(decode_command(&bytes), Some(command));
//! assert_eq!(decode_command(&bytes[..bytes.len() - 1]), None);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use tracing::trace;

use crate::network::messages::{
    CommandBody, CommandHeader, NetCommand, NetCommandType, WrapperChunk, WRAPPER_ENVELOPE_LEN,
};
use crate::network::wire::{ByteReader, ByteWriter, WireError, WireResult};

const MARKER_TYPE: u8 = b'T';
const MARKER_FRAME: u8 = b'F';
const MARKER_PLAYER: u8 = b'P';
const MARKER_RELAY: u8 = b'R';
const MARKER_COMMAND_ID: u8 = b'C';
const MARKER_DATA: u8 = b'D';

// Fixed-size integers keep hashed encodings independent of the values involved.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the bincode helper was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a value.
    Encode,
    /// Decoding a value.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors from the bincode helpers.
///
/// Bincode errors are opaque, so the message is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for the bincode helpers.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a serde value with the crate's fixed-int bincode configuration.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::EncodeError {
        message: e.to_string(),
        operation: CodecOperation::Encode,
    })
}

/// Decodes a serde value, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::DecodeError {
        message: e.to_string(),
        operation: CodecOperation::Decode,
    })
}

// ###############
// # DECODING    #
// ###############

/// Header values that carry over between commands of one stream.
#[derive(Debug, Clone, Copy, Default)]
struct Carry {
    command_type: Option<NetCommandType>,
    frame: u32,
    player_id: u8,
    relay: u8,
}

fn read_command(reader: &mut ByteReader<'_>, carry: &mut Carry) -> WireResult<NetCommand> {
    let mut command_id = None;
    loop {
        let offset = reader.offset();
        match reader.read_u8()? {
            MARKER_TYPE => carry.command_type = Some(NetCommandType::try_from(reader.read_u8()?)?),
            MARKER_FRAME => carry.frame = reader.read_u32()?,
            MARKER_PLAYER => carry.player_id = reader.read_u8()?,
            MARKER_RELAY => carry.relay = reader.read_u8()?,
            MARKER_COMMAND_ID => command_id = Some(reader.read_u16()?),
            MARKER_DATA => break,
            marker => return Err(WireError::UnknownMarker { marker, offset }),
        }
    }

    let command_type = carry.command_type.ok_or(WireError::MissingCommandType)?;
    let body = read_body(reader, command_type)?;
    Ok(NetCommand::new(
        CommandHeader {
            frame: carry.frame,
            player_id: carry.player_id,
            relay: carry.relay,
            command_id,
        },
        body,
    ))
}

fn read_counted_utf16(reader: &mut ByteReader<'_>) -> WireResult<String> {
    let units = usize::from(reader.read_u8()?);
    reader.read_utf16(units)
}

fn read_body(reader: &mut ByteReader<'_>, command_type: NetCommandType) -> WireResult<CommandBody> {
    use NetCommandType as T;

    let body = match command_type {
        T::AckBoth => CommandBody::AckBoth {
            command_id: reader.read_u16()?,
            original_player: reader.read_u8()?,
        },
        T::AckStage1 => CommandBody::AckStage1 {
            command_id: reader.read_u16()?,
            original_player: reader.read_u8()?,
        },
        T::AckStage2 => CommandBody::AckStage2 {
            command_id: reader.read_u16()?,
            original_player: reader.read_u8()?,
        },
        T::FrameInfo => CommandBody::FrameInfo {
            command_count: reader.read_u16()?,
        },
        T::GameCommand => {
            let message_type = reader.read_u32()?;
            let len = usize::from(reader.read_u16()?);
            CommandBody::GameCommand {
                message_type,
                payload: reader.read_bytes(len)?.to_vec(),
            }
        },
        T::PlayerLeave => CommandBody::PlayerLeave {
            leaving_player: reader.read_u8()?,
        },
        T::RunAheadMetrics => CommandBody::RunAheadMetrics {
            average_latency: reader.read_f32()?,
            average_fps: reader.read_u16()?,
        },
        T::RunAhead => CommandBody::RunAhead {
            run_ahead: reader.read_u16()?,
            frame_rate: reader.read_u8()?,
        },
        T::DestroyPlayer => CommandBody::DestroyPlayer {
            player_index: reader.read_u32()?,
        },
        T::KeepAlive => CommandBody::KeepAlive,
        T::DisconnectChat => CommandBody::DisconnectChat {
            text: read_counted_utf16(reader)?,
        },
        T::Chat => CommandBody::Chat {
            text: read_counted_utf16(reader)?,
            player_mask: reader.read_i32()?,
        },
        T::ManglerQuery => CommandBody::ManglerQuery,
        T::ManglerResponse => CommandBody::ManglerResponse,
        T::Progress => CommandBody::Progress {
            percentage: reader.read_u8()?,
        },
        T::LoadComplete => CommandBody::LoadComplete,
        T::TimeoutStart => CommandBody::TimeoutStart,
        T::Wrapper => CommandBody::Wrapper(read_wrapper(reader)?),
        T::File => {
            let path = reader.read_cstring()?;
            let len = reader.read_u32()? as usize;
            CommandBody::File {
                path,
                data: reader.read_bytes(len)?.to_vec(),
            }
        },
        T::FileAnnounce => CommandBody::FileAnnounce {
            path: reader.read_cstring()?,
            file_id: reader.read_u16()?,
            player_mask: reader.read_u8()?,
        },
        T::FileProgress => CommandBody::FileProgress {
            file_id: reader.read_u16()?,
            progress: reader.read_i32()?,
        },
        T::FrameResendRequest => CommandBody::FrameResendRequest {
            frame_to_resend: reader.read_u32()?,
        },
        T::DisconnectStart => CommandBody::DisconnectStart,
        T::DisconnectKeepAlive => CommandBody::DisconnectKeepAlive,
        T::DisconnectPlayer => CommandBody::DisconnectPlayer {
            slot: reader.read_u8()?,
            disconnect_frame: reader.read_u32()?,
        },
        T::PacketRouterQuery => CommandBody::PacketRouterQuery,
        T::PacketRouterAck => CommandBody::PacketRouterAck,
        T::DisconnectVote => CommandBody::DisconnectVote {
            slot: reader.read_u8()?,
            vote_frame: reader.read_u32()?,
        },
        T::DisconnectFrame => CommandBody::DisconnectFrame {
            disconnect_frame: reader.read_u32()?,
        },
        T::DisconnectScreenOff => CommandBody::DisconnectScreenOff {
            new_frame: reader.read_u32()?,
        },
        T::DisconnectEnd => CommandBody::DisconnectEnd,
    };
    Ok(body)
}

fn read_wrapper(reader: &mut ByteReader<'_>) -> WireResult<WrapperChunk> {
    let wrapped_command_id = reader.read_u16()?;
    let chunk_number = reader.read_u32()?;
    let num_chunks = reader.read_u32()?;
    let total_data_length = reader.read_u32()?;
    let data_length = reader.read_u32()?;
    let data_offset = reader.read_u32()?;
    let data = reader.read_bytes(data_length as usize)?.to_vec();
    Ok(WrapperChunk {
        wrapped_command_id,
        chunk_number,
        num_chunks,
        total_data_length,
        data_length,
        data_offset,
        data,
    })
}

fn ensure_consumed(reader: &ByteReader<'_>) -> WireResult<()> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes {
            remaining: reader.remaining(),
        })
    }
}

/// Decodes one command occupying all of `bytes`, with its full error.
pub fn try_decode_command(bytes: &[u8]) -> WireResult<NetCommand> {
    let mut reader = ByteReader::new(bytes);
    let command = read_command(&mut reader, &mut Carry::default())?;
    ensure_consumed(&reader)?;
    Ok(command)
}

/// Decodes a stream of commands occupying all of `bytes`, with its full error.
pub fn try_decode_command_stream(bytes: &[u8]) -> WireResult<Vec<NetCommand>> {
    let mut reader = ByteReader::new(bytes);
    let mut carry = Carry::default();
    let mut commands = Vec::new();
    while !reader.is_empty() {
        commands.push(read_command(&mut reader, &mut carry)?);
    }
    Ok(commands)
}

/// Decodes one command. Missing `F`, `P` and `R` markers default to 0.
///
/// Returns `None` for any malformed input, including bytes left after the body.
#[must_use]
pub fn decode_command(bytes: &[u8]) -> Option<NetCommand> {
    try_decode_command(bytes)
        .map_err(|e| trace!("Dropping malformed command ({} bytes): {}", bytes.len(), e))
        .ok()
}

/// Decodes back-to-back commands.
///
/// `T`, `F`, `P` and `R` carry over from the previous command when a command omits them; `C`
/// applies only to the command it appears in. An empty input is an empty stream. One malformed
/// command fails the whole stream.
#[must_use]
pub fn decode_command_stream(bytes: &[u8]) -> Option<Vec<NetCommand>> {
    try_decode_command_stream(bytes)
        .map_err(|e| trace!("Dropping malformed command stream ({} bytes): {}", bytes.len(), e))
        .ok()
}

/// Decodes a bare wrapper-chunk envelope and its data.
#[must_use]
pub fn decode_wrapper_chunk(bytes: &[u8]) -> Option<WrapperChunk> {
    let mut reader = ByteReader::new(bytes);
    read_wrapper(&mut reader)
        .and_then(|chunk| ensure_consumed(&reader).map(|()| chunk))
        .map_err(|e| trace!("Dropping malformed wrapper chunk ({} bytes): {}", bytes.len(), e))
        .ok()
}

// ###############
// # ENCODING    #
// ###############

/// Converts a length to the integer type of its prefix.
fn prefix_len<T: TryFrom<usize>>(len: usize, max: usize) -> WireResult<T> {
    T::try_from(len)
        .ok()
        .ok_or(WireError::FieldTooLong { len, max })
}

fn write_counted_utf16(writer: &mut ByteWriter, text: &str) -> WireResult<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let count = prefix_len::<u8>(units.len(), usize::from(u8::MAX))?;
    writer.write_u8(count);
    writer.write_utf16(&units);
    Ok(())
}

fn write_cstring(writer: &mut ByteWriter, text: &str) -> WireResult<()> {
    // An interior NUL would end the path early on the receiving side.
    if let Some(pos) = text.bytes().position(|b| b == 0) {
        return Err(WireError::InvalidText { offset: pos });
    }
    writer.write_cstring(text);
    Ok(())
}

fn write_body(writer: &mut ByteWriter, body: &CommandBody) -> WireResult<()> {
    match body {
        CommandBody::AckBoth {
            command_id,
            original_player,
        }
        | CommandBody::AckStage1 {
            command_id,
            original_player,
        }
        | CommandBody::AckStage2 {
            command_id,
            original_player,
        } => {
            writer.write_u16(*command_id);
            writer.write_u8(*original_player);
        },
        CommandBody::FrameInfo { command_count } => writer.write_u16(*command_count),
        CommandBody::GameCommand {
            message_type,
            payload,
        } => {
            let len = prefix_len::<u16>(payload.len(), usize::from(u16::MAX))?;
            writer.write_u32(*message_type);
            writer.write_u16(len);
            writer.write_bytes(payload);
        },
        CommandBody::PlayerLeave { leaving_player } => writer.write_u8(*leaving_player),
        CommandBody::RunAheadMetrics {
            average_latency,
            average_fps,
        } => {
            writer.write_f32(*average_latency);
            writer.write_u16(*average_fps);
        },
        CommandBody::RunAhead {
            run_ahead,
            frame_rate,
        } => {
            writer.write_u16(*run_ahead);
            writer.write_u8(*frame_rate);
        },
        CommandBody::DestroyPlayer { player_index } => writer.write_u32(*player_index),
        CommandBody::DisconnectChat { text } => write_counted_utf16(writer, text)?,
        CommandBody::Chat { text, player_mask } => {
            write_counted_utf16(writer, text)?;
            writer.write_i32(*player_mask);
        },
        CommandBody::Progress { percentage } => writer.write_u8(*percentage),
        CommandBody::Wrapper(chunk) => write_wrapper(writer, chunk)?,
        CommandBody::File { path, data } => {
            let len = prefix_len::<u32>(data.len(), u32::MAX as usize)?;
            write_cstring(writer, path)?;
            writer.write_u32(len);
            writer.write_bytes(data);
        },
        CommandBody::FileAnnounce {
            path,
            file_id,
            player_mask,
        } => {
            write_cstring(writer, path)?;
            writer.write_u16(*file_id);
            writer.write_u8(*player_mask);
        },
        CommandBody::FileProgress { file_id, progress } => {
            writer.write_u16(*file_id);
            writer.write_i32(*progress);
        },
        CommandBody::FrameResendRequest { frame_to_resend } => writer.write_u32(*frame_to_resend),
        CommandBody::DisconnectPlayer {
            slot,
            disconnect_frame,
        } => {
            writer.write_u8(*slot);
            writer.write_u32(*disconnect_frame);
        },
        CommandBody::DisconnectVote { slot, vote_frame } => {
            writer.write_u8(*slot);
            writer.write_u32(*vote_frame);
        },
        CommandBody::DisconnectFrame { disconnect_frame } => writer.write_u32(*disconnect_frame),
        CommandBody::DisconnectScreenOff { new_frame } => writer.write_u32(*new_frame),
        CommandBody::KeepAlive
        | CommandBody::ManglerQuery
        | CommandBody::ManglerResponse
        | CommandBody::LoadComplete
        | CommandBody::TimeoutStart
        | CommandBody::DisconnectStart
        | CommandBody::DisconnectKeepAlive
        | CommandBody::PacketRouterQuery
        | CommandBody::PacketRouterAck
        | CommandBody::DisconnectEnd => {},
    }
    Ok(())
}

fn write_wrapper(writer: &mut ByteWriter, chunk: &WrapperChunk) -> WireResult<()> {
    if chunk.data_length as usize != chunk.data.len() {
        return Err(WireError::LengthMismatch {
            declared: chunk.data_length as usize,
            actual: chunk.data.len(),
        });
    }
    writer.write_u16(chunk.wrapped_command_id);
    writer.write_u32(chunk.chunk_number);
    writer.write_u32(chunk.num_chunks);
    writer.write_u32(chunk.total_data_length);
    writer.write_u32(chunk.data_length);
    writer.write_u32(chunk.data_offset);
    writer.write_bytes(&chunk.data);
    Ok(())
}

/// Writes the markers of `command` that differ from `previous`, then `'D'` and the body.
fn write_command(
    writer: &mut ByteWriter,
    command: &NetCommand,
    previous: Option<&NetCommand>,
) -> WireResult<()> {
    let header = &command.header;
    let command_type = command.command_type();

    if previous.is_none_or(|p| p.command_type() != command_type) {
        writer.write_u8(MARKER_TYPE);
        writer.write_u8(command_type.as_u8());
    }
    if previous.is_none_or(|p| p.header.frame != header.frame) {
        writer.write_u8(MARKER_FRAME);
        writer.write_u32(header.frame);
    }
    if previous.is_none_or(|p| p.header.player_id != header.player_id) {
        writer.write_u8(MARKER_PLAYER);
        writer.write_u8(header.player_id);
    }
    if previous.is_none_or(|p| p.header.relay != header.relay) {
        writer.write_u8(MARKER_RELAY);
        writer.write_u8(header.relay);
    }
    if let Some(command_id) = header.command_id {
        writer.write_u8(MARKER_COMMAND_ID);
        writer.write_u16(command_id);
    }
    writer.write_u8(MARKER_DATA);
    write_body(writer, &command.body)
}

/// Encodes one command with every header marker present.
///
/// Fails only when a field does not fit its length prefix (text over 255 UTF-16 units, a
/// game-command payload over 65535 bytes), a path contains NUL, or a wrapper chunk's
/// `data_length` disagrees with its data.
pub fn encode_command(command: &NetCommand) -> WireResult<Vec<u8>> {
    let mut writer = ByteWriter::with_capacity(32);
    write_command(&mut writer, command, None)?;
    Ok(writer.into_bytes())
}

/// Encodes commands back to back, omitting `T`, `F`, `P` and `R` when unchanged from the previous
/// command. [`decode_command_stream`] restores the omitted values.
pub fn encode_command_stream(commands: &[NetCommand]) -> WireResult<Vec<u8>> {
    let mut writer = ByteWriter::with_capacity(commands.len() * 16);
    let mut previous = None;
    for command in commands {
        write_command(&mut writer, command, previous)?;
        previous = Some(command);
    }
    Ok(writer.into_bytes())
}

/// Encodes a bare wrapper-chunk envelope and its data.
pub fn encode_wrapper_chunk(chunk: &WrapperChunk) -> WireResult<Vec<u8>> {
    let mut writer = ByteWriter::with_capacity(WRAPPER_ENVELOPE_LEN + chunk.data.len());
    write_wrapper(&mut writer, chunk)?;
    Ok(writer.into_bytes())
}

/// Splits `payload` into wrapper chunks of at most `max_chunk_data` bytes each.
///
/// An empty payload still produces one (empty) chunk so that the receiver learns the total
/// length. A `max_chunk_data` of 0 is treated as 1.
///
/// # Errors
///
/// [`WireError::FieldTooLong`] if the payload does not fit a `u32` length.
pub fn split_into_chunks(
    wrapped_command_id: u16,
    payload: &[u8],
    max_chunk_data: usize,
) -> WireResult<Vec<WrapperChunk>> {
    let total_data_length = prefix_len::<u32>(payload.len(), u32::MAX as usize)?;
    let chunk_size = max_chunk_data.max(1);
    if payload.is_empty() {
        return Ok(vec![WrapperChunk {
            wrapped_command_id,
            num_chunks: 1,
            ..WrapperChunk::default()
        }]);
    }

    let num_chunks = payload.len().div_ceil(chunk_size) as u32;
    let chunks = payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| WrapperChunk {
            wrapped_command_id,
            chunk_number: index as u32,
            num_chunks,
            total_data_length,
            data_length: data.len() as u32,
            data_offset: (index * chunk_size) as u32,
            data: data.to_vec(),
        })
        .collect();
    Ok(chunks)
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

    fn header(frame: u32, player_id: u8, command_id: Option<u16>) -> CommandHeader {
        CommandHeader {
            frame,
            player_id,
            relay: 0,
            command_id,
        }
    }

    #[test]
    fn frame_info_bytes_are_pinned() {
        let command = NetCommand::new(
            header(0x0102_0304, 2, Some(0xabcd)),
            CommandBody::FrameInfo { command_count: 5 },
        );
        let bytes = encode_command(&command).unwrap();
        assert_eq!(
            bytes,
            vec![
                b'T', 3, //
                b'F', 0x04, 0x03, 0x02, 0x01, //
                b'P', 2, //
                b'R', 0, //
                b'C', 0xcd, 0xab, //
                b'D', 5, 0,
            ]
        );
        assert_eq!(decode_command(&bytes), Some(command));
    }

    #[test]
    fn decodes_minimal_header_with_defaults() {
        let bytes = [b'T', 9, b'D'];
        let command = decode_command(&bytes).unwrap();
        assert_eq!(command.header, CommandHeader::default());
        assert_eq!(command.body, CommandBody::KeepAlive);
    }

    #[test]
    fn repeated_markers_keep_the_last_value() {
        let bytes = [b'T', 9, b'P', 1, b'P', 4, b'D'];
        assert_eq!(decode_command(&bytes).unwrap().header.player_id, 4);
    }

    #[test]
    fn missing_type_is_rejected() {
        assert_eq!(
            try_decode_command(&[b'F', 1, 0, 0, 0, b'D']),
            Err(WireError::MissingCommandType)
        );
    }

    #[test]
    fn unknown_marker_is_rejected() {
        assert_eq!(
            try_decode_command(&[b'T', 9, b'X', b'D']),
            Err(WireError::UnknownMarker {
                marker: b'X',
                offset: 2
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(decode_command(&[b'T', 200, b'D']), None);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            try_decode_command(&[b'T', 9, b'D', 0]),
            Err(WireError::TrailingBytes { remaining: 1 })
        ));
    }

    #[test]
    fn every_truncation_of_a_command_fails() {
        let command = NetCommand::new(
            header(7, 1, Some(64001)),
            CommandBody::Chat {
                text: "gg".to_owned(),
                player_mask: -1,
            },
        );
        let bytes = encode_command(&command).unwrap();
        for len in 0..bytes.len() {
            assert_eq!(decode_command(&bytes[..len]), None, "prefix of {len} bytes");
        }
        assert!(decode_command(&bytes).is_some());
    }

    #[test]
    fn chat_body_layout() {
        let command = NetCommand::new(
            header(0, 0, None),
            CommandBody::Chat {
                text: "hi".to_owned(),
                player_mask: 3,
            },
        );
        let bytes = encode_command(&command).unwrap();
        let body = &bytes[bytes.len() - 9..];
        assert_eq!(body, &[2, b'h', 0, b'i', 0, 3, 0, 0, 0]);
    }

    #[test]
    fn file_body_layout() {
        let command = NetCommand::new(
            header(0, 0, Some(1)),
            CommandBody::File {
                path: "a.map".to_owned(),
                data: vec![9, 8],
            },
        );
        let bytes = encode_command(&command).unwrap();
        let body = &bytes[bytes.len() - 12..];
        assert_eq!(body, b"a.map\0\x02\0\0\0\x09\x08");
        assert_eq!(decode_command(&bytes), Some(command));
    }

    #[test]
    fn file_path_with_nul_is_not_encodable() {
        let command = NetCommand::new(
            header(0, 0, None),
            CommandBody::FileAnnounce {
                path: "a\0b".to_owned(),
                file_id: 1,
                player_mask: 0,
            },
        );
        assert!(encode_command(&command).is_err());
    }

    #[test]
    fn oversized_chat_is_not_encodable() {
        let command = NetCommand::new(
            header(0, 0, None),
            CommandBody::DisconnectChat {
                text: "x".repeat(256),
            },
        );
        assert_eq!(
            encode_command(&command),
            Err(WireError::FieldTooLong { len: 256, max: 255 })
        );
    }

    #[test]
    fn wrapper_envelope_is_22_bytes_plus_data() {
        let chunk = WrapperChunk {
            wrapped_command_id: 0x0201,
            chunk_number: 1,
            num_chunks: 2,
            total_data_length: 5,
            data_length: 2,
            data_offset: 3,
            data: vec![0xaa, 0xbb],
        };
        let bytes = encode_wrapper_chunk(&chunk).unwrap();
        assert_eq!(bytes.len(), WRAPPER_ENVELOPE_LEN + 2);
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
        assert_eq!(&bytes[18..22], &[3, 0, 0, 0]);
        assert_eq!(decode_wrapper_chunk(&bytes), Some(chunk));
        assert_eq!(decode_wrapper_chunk(&bytes[..bytes.len() - 1]), None);
    }

    #[test]
    fn wrapper_with_inconsistent_length_is_not_encodable() {
        let chunk = WrapperChunk {
            data_length: 3,
            data: vec![1],
            ..WrapperChunk::default()
        };
        assert!(matches!(
            encode_wrapper_chunk(&chunk),
            Err(WireError::LengthMismatch {
                declared: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn stream_carries_header_fields_but_not_command_id() {
        let bytes = [
            b'T', 3, b'F', 10, 0, 0, 0, b'P', 2, b'C', 5, 0, b'D', 1, 0, // frame info
            b'F', 11, 0, 0, 0, b'D', 0, 0, // frame info, frame changed
            b'T', 9, b'D', // keepalive
        ];
        let commands = decode_command_stream(&bytes).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].header, header(10, 2, Some(5)));
        assert_eq!(commands[1].header, header(11, 2, None));
        assert_eq!(commands[1].body, CommandBody::FrameInfo { command_count: 0 });
        assert_eq!(commands[2].header, header(11, 2, None));
        assert_eq!(commands[2].body, CommandBody::KeepAlive);
    }

    #[test]
    fn stream_encoding_omits_unchanged_markers() {
        let commands = vec![
            NetCommand::new(header(4, 1, Some(10)), CommandBody::FrameInfo { command_count: 2 }),
            NetCommand::new(header(4, 1, Some(11)), CommandBody::FrameInfo { command_count: 0 }),
        ];
        let bytes = encode_command_stream(&commands).unwrap();
        let single = encode_command(&commands[0]).unwrap();
        // second command: C + id + D + body
        assert_eq!(bytes.len(), single.len() + 3 + 1 + 2);
        assert_eq!(decode_command_stream(&bytes), Some(commands));
    }

    #[test]
    fn one_bad_command_fails_the_stream() {
        let bytes = [b'T', 9, b'D', b'T', 9, b'Q', b'D'];
        assert_eq!(decode_command_stream(&bytes), None);
        assert_eq!(decode_command_stream(&[]), Some(Vec::new()));
    }

    #[test]
    fn split_covers_payload() {
        let payload: Vec<u8> = (0..10).collect();
        let chunks = split_into_chunks(7, &payload, 4).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.num_chunks == 3 && c.total_data_length == 10));
        assert_eq!(chunks[2].data_offset, 8);
        assert_eq!(chunks[2].data, vec![8, 9]);
        let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn split_of_empty_payload_is_one_empty_chunk() {
        let chunks = split_into_chunks(1, &[], 100).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_chunks, 1);
        assert_eq!(chunks[0].total_data_length, 0);
    }

    #[test]
    fn bincode_helpers_round_trip() {
        let bytes = encode(&(1u16, "x")).unwrap();
        let ((a, b), read): ((u16, String), _) = decode(&bytes).unwrap();
        assert_eq!((a, b.as_str()), (1, "x"));
        assert_eq!(read, bytes.len());
        assert!(decode::<u64>(&[1, 2]).is_err());
    }
}
