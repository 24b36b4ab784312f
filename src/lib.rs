//! # Fortress Lockstep
//!
//! Fortress Lockstep keeps independent, identically-coded simulation instances of a real-time
//! match in agreement over an unreliable network, without a central authority. Every peer runs
//! the same deterministic simulation; only commands cross the wire.
//!
//! The crate is the core of such a peer:
//!
//! - [`network`] decodes and encodes the marker-tagged command stream, reassembles chunked
//!   ("wrapped") commands and classifies command types by delivery requirement.
//! - [`state::kernel`] orders and deduplicates synchronized commands, allocates object ids and
//!   computes, records and compares per-frame hashes and full GameLogic CRCs.
//! - [`state::frame_state`] tracks per-player frame readiness, asks for resends, and runs the
//!   disconnect stall/vote/timeout state machine.
//! - [`state::archive`] keeps a bounded window of sent commands for catch-up resends.
//! - [`game_loop`] is a fixed-timestep scheduler that the caller gates on frame readiness.
//!
//! Like the rest of the Fortress family, the library never calls back into user code from
//! inside a record or evaluate call. Notifications are queued and drained through `events()`.
//!
//! Everything runs on one logical thread; no component takes a lock on the hot path.

#![forbid(unsafe_code)] // let us try
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::{
    ArchiveConfig, AssemblyConfig, CommandIdConfig, DisconnectConfig, GameLoopConfig,
    LockstepConfig,
};
pub use crc::CrcAccumulator;
pub use error::LockstepError;
pub use event_drain::EventDrain;
pub use frame_info::{Command, FrameSnapshot};
pub use game_loop::{FrameHandle, FrameScheduler, GameLoop, ManualScheduler, SystemScheduler};
pub use network::assembly::{AssemblyError, AssemblyProgress, WrapperAssembler};
pub use network::codec::{
    decode_command, decode_command_stream, decode_wrapper_chunk, encode_command,
    encode_command_stream, encode_wrapper_chunk, split_into_chunks,
};
pub use network::command_ids::{CommandIdSequencer, CommandRequirements};
pub use network::messages::{CommandBody, CommandHeader, NetCommand, NetCommandType, WrapperChunk};
pub use state::archive::{FrameResendArchive, ResendFrame, ResendPlan, ResendSender};
pub use state::disconnect::{DisconnectStatus, PacketRouterWait, ResendTarget};
pub use state::frame_state::{
    ContinuationState, DeterministicFrameState, DisconnectCommandOutcome, FrameReadiness,
    FrameStateEvent, PlayerFrameReadiness, StallUpdate,
};
pub use state::kernel::{
    ConsensusResult, ConsensusStatus, CrcOptions, DeterministicStateKernel,
    GameLogicCrcSectionWriters, KernelEvent,
};
pub use state::slots::{from_translated_slot, to_translated_slot};

pub mod config;
pub mod crc;
#[doc(hidden)]
pub mod error;
pub mod event_drain;
#[doc(hidden)]
pub mod frame_info;
pub mod game_loop;
pub mod telemetry;

/// Wire-level concerns: byte codec, chunk reassembly, command-id sequencing and adapters.
pub mod network {
    pub mod adapter;
    pub mod assembly;
    /// Marker-stream codec for wrapped commands and the wrapper-chunk envelope.
    ///
    /// Decoding never panics and never skips: any malformed input yields `None`.
    pub mod codec;
    pub mod command_ids;
    pub mod messages;
    #[doc(hidden)]
    pub mod wire;
}

/// Deterministic state: command ordering, digests, readiness and disconnect handling.
pub mod state {
    pub mod archive;
    pub mod command_queue;
    pub mod digest;
    pub mod disconnect;
    pub mod frame_state;
    pub mod kernel;
    pub mod object_ids;
    pub mod slots;
}

/// Internal module exposing implementation details for testing, fuzzing, and benchmarks.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here may change without notice
/// and is intended only for fuzzing, property-based testing and integration tests in the same
/// workspace.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::wire::{ByteReader, ByteWriter, WireError};
    pub use crate::state::command_queue::CommandQueue;
    pub use crate::state::digest::DigestLedger;
    pub use crate::state::disconnect::{DisconnectVotes, PacketRouterTracker};
    pub use crate::state::object_ids::ObjectIdAllocator;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The maximum number of player slots in a match.
pub const MAX_SLOTS: usize = 8;

/// How far (in frames) a peer may run ahead of the slowest peer.
pub const MAX_FRAMES_AHEAD: i32 = 128;

/// How many frames of sent commands are retained for resends.
pub const FRAMES_TO_KEEP: i32 = MAX_FRAMES_AHEAD / 2 + 1;

/// The first object id handed out in a session.
pub const FIRST_OBJECT_ID: ObjectId = ObjectId(1);

/// The exclusive upper bound of the object id space. Allocation fails once the counter reaches it.
pub const MAX_OBJECT_ID: ObjectId = ObjectId(0x7FFF_FFFF);

/// A frame is a single step of simulation.
///
/// Frames are the unit of command ordering and agreement checking. Frame numbers start at 0
/// and increment sequentially. The special value [`NULL_FRAME`] (-1) represents "no frame".
///
/// On the wire frames are unsigned 32-bit integers; use [`Frame::from_wire`] and
/// [`Frame::to_wire`] at that boundary.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
///
/// let next_frame = frame + 1;
/// assert_eq!(next_frame.as_i32(), 1);
/// assert!(next_frame > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    ///
    /// Note: This does not validate the frame number. Use [`Frame::is_valid()`]
    /// to check if the frame represents a valid (non-negative) frame number.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame (equivalent to [`NULL_FRAME`]).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    ///
    /// # Examples
    ///
    /// ```
    /// use fortress_lockstep::Frame;
    ///
    /// assert!(Frame::new(0).is_valid());
    /// assert!(!Frame::NULL.is_valid());
    /// assert!(!Frame::new(-5).is_valid());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Converts a wire frame number. Values above `i32::MAX` are not representable and yield `None`.
    #[inline]
    #[must_use]
    pub fn from_wire(frame: u32) -> Option<Frame> {
        i32::try_from(frame).ok().map(Frame)
    }

    /// Converts to the wire representation. Invalid frames map to 0.
    #[inline]
    #[must_use]
    pub fn to_wire(self) -> u32 {
        u32::try_from(self.0).unwrap_or(0)
    }

    /// Subtracts `rhs` frames, stopping at frame 0.
    #[inline]
    #[must_use]
    pub fn saturating_sub(self, rhs: i32) -> Frame {
        Frame(self.0.saturating_sub(rhs).max(0))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// Arithmetic operations

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// The slot of a player in a match.
///
/// Player ids are one byte on the wire. Slots `0..num_slots` are valid for a match; most
/// stateful components validate ids against their configured slot count and return
/// [`LockstepError::InvalidPlayer`] otherwise.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::PlayerId;
///
/// let player = PlayerId::new(3);
/// assert_eq!(player.as_u8(), 3);
/// assert_eq!(player.as_usize(), 3);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(u8);

impl PlayerId {
    /// Creates a new `PlayerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        PlayerId(id)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the id as an index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for PlayerId {
    #[inline]
    fn from(value: u8) -> Self {
        PlayerId(value)
    }
}

/// A set of players small enough to never leave the stack.
pub type PlayerSet = smallvec::SmallVec<[PlayerId; MAX_SLOTS]>;

/// Identifier of a simulation object. Never reused within a session.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Creates a new `ObjectId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        ObjectId(id)
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
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
    fn frames_to_keep_matches_window() {
        assert_eq!(FRAMES_TO_KEEP, 65);
    }

    #[test]
    fn frame_wire_conversion() {
        assert_eq!(Frame::from_wire(42), Some(Frame::new(42)));
        assert_eq!(Frame::from_wire(u32::MAX), None);
        assert_eq!(Frame::new(7).to_wire(), 7);
        assert_eq!(Frame::NULL.to_wire(), 0);
    }

    #[test]
    fn frame_saturating_sub_stops_at_zero() {
        assert_eq!(Frame::new(10).saturating_sub(3), Frame::new(7));
        assert_eq!(Frame::new(10).saturating_sub(65), Frame::new(0));
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(12).to_string(), "12");
    }

    #[test]
    fn player_id_roundtrips_through_u8() {
        let id = PlayerId::from(5u8);
        assert_eq!(id.as_u8(), 5);
        assert_eq!(id.to_string(), "5");
    }
}
