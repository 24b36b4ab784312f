//! The deterministic state kernel: object ids, command ordering, and desync detection.
//!
//! # Digests
//!
//! Two digest classes are computed and compared between peers:
//!
//! - The **frame hash**, a cheap per-frame digest of [`FrameSnapshot`] metadata
//!   ([`hash_deterministic_frame_metadata`]).
//! - The **GameLogic CRC**, a full-state digest built by caller-supplied section writers
//!   ([`hash_deterministic_game_logic_crc`]).
//!
//! Both are recorded locally and remotely per frame. A remote value that differs from the local
//! one marks the frame as mismatched, queues exactly one [`KernelEvent`] for it and reports a
//! [`ViolationKind::DigestMismatch`] to the observer. Recovery policy is up to the caller.
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::{Command, DeterministicStateKernel, FrameSnapshot, Frame, PlayerId};
//!
//! let mut kernel = DeterministicStateKernel::new();
//! kernel.enqueue_command(Command::new(4, PlayerId::new(1), 40, vec![]));
//! kernel.enqueue_command(Command::new(2, PlayerId::new(3), 10, vec![]));
//!
//! let commands = kernel.drain_commands();
//! assert_eq!(commands[0].command_type, 2);
//!
//! let snapshot = FrameSnapshot::new(Frame::new(1), kernel.next_object_id(), 0x1234)
//!     .with_commands(commands);
//! let hash = DeterministicStateKernel::hash_deterministic_frame_metadata(&snapshot);
//! kernel.record_local_frame_hash(Frame::new(1), hash).unwrap();
//! kernel.record_remote_frame_hash(Frame::new(1), PlayerId::new(1), hash).unwrap();
//! assert!(kernel.frame_hash_mismatched_frames().is_empty());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::crc::CrcAccumulator;
use crate::error::{ensure_valid_frame, ensure_valid_player};
use crate::event_drain::EventDrain;
use crate::frame_info::{Command, FrameSnapshot};
use crate::report_violation_to;
use crate::state::command_queue::CommandQueue;
use crate::state::digest::DigestLedger;
use crate::state::object_ids::ObjectIdAllocator;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, LockstepError, ObjectId, PlayerId, PlayerSet, MAX_SLOTS};

pub use crate::state::digest::{ConsensusResult, ConsensusStatus};

/// Marker fed before the objects section.
pub const MARKER_OBJECTS: &str = "MARKER:Objects";
/// Marker fed before the partition manager section.
pub const MARKER_PARTITION_MANAGER: &str = "MARKER:ThePartitionManager";
/// Marker fed before the optional module factory section.
pub const MARKER_MODULE_FACTORY: &str = "MARKER:TheModuleFactory";
/// Marker fed before the player list section.
pub const MARKER_PLAYER_LIST: &str = "MARKER:ThePlayerList";
/// Marker fed before the AI section.
pub const MARKER_AI: &str = "MARKER:TheAI";

/// Notifications queued by the kernel. Drain them with [`DeterministicStateKernel::events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum KernelEvent {
    /// A remote frame hash differs from the local one. Queued once per frame.
    FrameHashMismatch {
        /// The mismatched frame.
        frame: Frame,
    },
    /// A remote GameLogic CRC differs from the local one. Queued once per frame.
    GameLogicCrcMismatch {
        /// The mismatched frame.
        frame: Frame,
    },
}

/// Writes one state section into the accumulator.
pub type SectionWriter<'a> = Box<dyn Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a>;

/// The state sections of a GameLogic CRC, supplied by the simulation.
///
/// The sections are always fed in the order objects, partition manager, module factory
/// (optional), player list, AI, no matter in which order the writers were set.
pub struct GameLogicCrcSectionWriters<'a> {
    /// Feeds the simulation objects.
    pub write_objects: SectionWriter<'a>,
    /// Feeds the spatial partitioning state.
    pub write_partition_manager: SectionWriter<'a>,
    /// Feeds the player list.
    pub write_player_list: SectionWriter<'a>,
    /// Feeds the AI state.
    pub write_ai: SectionWriter<'a>,
    /// Feeds the module factory state. Required when [`CrcOptions::include_module_factory`] is set.
    pub write_module_factory: Option<SectionWriter<'a>>,
}

impl<'a> GameLogicCrcSectionWriters<'a> {
    /// Bundles the four mandatory writers.
    pub fn new(
        write_objects: impl Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a,
        write_partition_manager: impl Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a,
        write_player_list: impl Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a,
        write_ai: impl Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a,
    ) -> Self {
        Self {
            write_objects: Box::new(write_objects),
            write_partition_manager: Box::new(write_partition_manager),
            write_player_list: Box::new(write_player_list),
            write_ai: Box::new(write_ai),
            write_module_factory: None,
        }
    }

    /// Adds the module factory writer.
    #[must_use]
    pub fn with_module_factory(
        mut self,
        write_module_factory: impl Fn(&mut CrcAccumulator, &FrameSnapshot) + 'a,
    ) -> Self {
        self.write_module_factory = Some(Box::new(write_module_factory));
        self
    }
}

impl fmt::Debug for GameLogicCrcSectionWriters<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameLogicCrcSectionWriters")
            .field("has_module_factory", &self.write_module_factory.is_some())
            .finish_non_exhaustive()
    }
}

/// Options for [`hash_deterministic_game_logic_crc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrcOptions {
    /// Feed the module factory section.
    pub include_module_factory: bool,
}

/// Digest of a snapshot's metadata: frame, next object id, random seed CRC, and every command
/// in the given order.
///
/// Pure. Equal snapshots hash equal; reordering commands changes the hash.
#[must_use]
pub fn hash_deterministic_frame_metadata(snapshot: &FrameSnapshot) -> u32 {
    let mut crc = CrcAccumulator::new();
    crc.add_int(snapshot.frame.as_i32());
    crc.add_unsigned_int(snapshot.next_object_id.as_u32());
    crc.add_unsigned_int(snapshot.random_seed_crc);
    crc.add_unsigned_int(snapshot.commands.len() as u32);
    for command in &snapshot.commands {
        crc.add_unsigned_int(command.command_type);
        crc.add_unsigned_byte(command.player_id.as_u8());
        crc.add_unsigned_int(command.sort_number);
        crc.add_unsigned_int(command.payload.len() as u32);
        crc.add_bytes(&command.payload);
    }
    crc.value()
}

/// GameLogic CRC of a snapshot: every section preceded by its literal marker, fed through one
/// accumulator.
///
/// # Errors
///
/// [`LockstepError::MissingSectionWriter`] if `options.include_module_factory` is set but
/// `writers` has no module factory writer. No writer runs in that case.
pub fn hash_deterministic_game_logic_crc(
    snapshot: &FrameSnapshot,
    writers: &GameLogicCrcSectionWriters<'_>,
    options: CrcOptions,
) -> Result<u32, LockstepError> {
    let module_factory = if options.include_module_factory {
        Some(
            writers
                .write_module_factory
                .as_ref()
                .ok_or(LockstepError::MissingSectionWriter {
                    section: MARKER_MODULE_FACTORY,
                })?,
        )
    } else {
        None
    };

    let mut crc = CrcAccumulator::new();
    crc.add_ascii_string(MARKER_OBJECTS);
    (writers.write_objects)(&mut crc, snapshot);
    crc.add_ascii_string(MARKER_PARTITION_MANAGER);
    (writers.write_partition_manager)(&mut crc, snapshot);
    if let Some(write_module_factory) = module_factory {
        crc.add_ascii_string(MARKER_MODULE_FACTORY);
        write_module_factory(&mut crc, snapshot);
    }
    crc.add_ascii_string(MARKER_PLAYER_LIST);
    (writers.write_player_list)(&mut crc, snapshot);
    crc.add_ascii_string(MARKER_AI);
    (writers.write_ai)(&mut crc, snapshot);
    Ok(crc.value())
}

/// Owns object ids, the ordered command queue and both digest ledgers of one peer.
pub struct DeterministicStateKernel {
    object_ids: ObjectIdAllocator,
    queue: CommandQueue,
    frame_hashes: DigestLedger,
    game_logic_crcs: DigestLedger,
    event_queue: VecDeque<KernelEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for DeterministicStateKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicStateKernel")
            .field("object_ids", &self.object_ids)
            .field("queued_commands", &self.queue.len())
            .field("frame_hashes", &self.frame_hashes)
            .field("game_logic_crcs", &self.game_logic_crcs)
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl Default for DeterministicStateKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicStateKernel {
    /// Creates an empty kernel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            object_ids: ObjectIdAllocator::new(),
            queue: CommandQueue::new(),
            frame_hashes: DigestLedger::new(),
            game_logic_crcs: DigestLedger::new(),
            event_queue: VecDeque::new(),
            violation_observer: None,
        }
    }

    /// Routes violations to `observer` instead of the tracing fallback.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Drains queued [`KernelEvent`]s.
    pub fn events(&mut self) -> EventDrain<'_, KernelEvent> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    // ##############
    // # OBJECT IDS #
    // ##############

    /// Allocates the next object id. Exhaustion is unrecoverable for the match.
    pub fn allocate_object_id(&mut self) -> Result<ObjectId, LockstepError> {
        let result = self.object_ids.allocate();
        if let Err(err) = &result {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                Frame::NULL,
                "{}",
                err
            );
        }
        result
    }

    /// The id [`allocate_object_id`](Self::allocate_object_id) returns next.
    #[must_use]
    pub fn next_object_id(&self) -> ObjectId {
        self.object_ids.peek_next()
    }

    /// Moves the object id counter forward, e.g. when restoring a saved match. Never moves back.
    pub fn set_next_object_id(&mut self, next: ObjectId) -> Result<(), LockstepError> {
        self.object_ids.set_next(next)
    }

    // #################
    // # COMMAND QUEUE #
    // #################

    /// Inserts a synchronized command in order. Returns `false` for a duplicate dedupe key.
    pub fn enqueue_command(&mut self, command: Command) -> bool {
        self.queue.enqueue(command)
    }

    /// Queued commands in execution order, without removing them.
    pub fn peek_commands(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    /// Removes and returns the next command in execution order.
    pub fn dequeue_command(&mut self) -> Option<Command> {
        self.queue.dequeue()
    }

    /// Removes and returns every queued command in execution order.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        self.queue.drain()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn queued_command_count(&self) -> usize {
        self.queue.len()
    }

    /// True if a command with this dedupe key was ever accepted.
    #[must_use]
    pub fn has_seen_dedupe_key(&self, key: &str) -> bool {
        self.queue.contains_dedupe_key(key)
    }

    // ###########
    // # HASHING #
    // ###########

    /// See [`hash_deterministic_frame_metadata`].
    #[must_use]
    pub fn hash_deterministic_frame_metadata(snapshot: &FrameSnapshot) -> u32 {
        hash_deterministic_frame_metadata(snapshot)
    }

    /// See [`hash_deterministic_game_logic_crc`].
    pub fn hash_deterministic_game_logic_crc(
        snapshot: &FrameSnapshot,
        writers: &GameLogicCrcSectionWriters<'_>,
        options: CrcOptions,
    ) -> Result<u32, LockstepError> {
        hash_deterministic_game_logic_crc(snapshot, writers, options)
    }

    // ###############
    // # FRAME HASH  #
    // ###############

    /// Records this peer's frame hash.
    pub fn record_local_frame_hash(&mut self, frame: Frame, hash: u32) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        if self.frame_hashes.record_local(frame, hash) {
            self.on_mismatch(DigestClass::FrameHash, frame);
        }
        Ok(())
    }

    /// Records the frame hash `player` reported.
    pub fn record_remote_frame_hash(
        &mut self,
        frame: Frame,
        player: PlayerId,
        hash: u32,
    ) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        ensure_valid_player(player, MAX_SLOTS)?;
        if self.frame_hashes.record_remote(frame, player, hash) {
            self.on_mismatch(DigestClass::FrameHash, frame);
        }
        Ok(())
    }

    /// The local frame hash of `frame`.
    #[must_use]
    pub fn local_frame_hash(&self, frame: Frame) -> Option<u32> {
        self.frame_hashes.local(frame)
    }

    /// True if `frame` has a mismatched frame hash.
    #[must_use]
    pub fn is_frame_hash_mismatched(&self, frame: Frame) -> bool {
        self.frame_hashes.is_mismatched(frame)
    }

    /// Every frame with a mismatched frame hash, ascending.
    #[must_use]
    pub fn frame_hash_mismatched_frames(&self) -> Vec<Frame> {
        self.frame_hashes.mismatched_frames()
    }

    /// Frames whose frame hash cannot be validated yet against `expected`.
    #[must_use]
    pub fn pending_frame_hash_frames(&self, expected: &[PlayerId]) -> Vec<Frame> {
        self.frame_hashes.pending_validation_frames(expected)
    }

    /// Players in `expected` that have not reported a frame hash for `frame`.
    #[must_use]
    pub fn pending_frame_hash_players(&self, frame: Frame, expected: &[PlayerId]) -> PlayerSet {
        self.frame_hashes.pending_validation_players(frame, expected)
    }

    /// Frame hash consensus for `frame`.
    pub fn evaluate_frame_hash_consensus(
        &self,
        frame: Frame,
        expected: &[PlayerId],
        self_id: PlayerId,
    ) -> Result<ConsensusResult, LockstepError> {
        ensure_valid_frame(frame)?;
        Ok(self.frame_hashes.consensus(frame, expected, self_id))
    }

    /// Forgets frame hashes (and their mismatch state) before `frame`.
    pub fn prune_frame_hashes_before(&mut self, frame: Frame) {
        self.frame_hashes.prune_before(frame);
    }

    // ##################
    // # GAMELOGIC CRC  #
    // ##################

    /// Records this peer's GameLogic CRC.
    pub fn record_local_game_logic_crc(&mut self, frame: Frame, crc: u32) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        if self.game_logic_crcs.record_local(frame, crc) {
            self.on_mismatch(DigestClass::GameLogicCrc, frame);
        }
        Ok(())
    }

    /// Records the GameLogic CRC `player` reported.
    pub fn record_remote_game_logic_crc(
        &mut self,
        frame: Frame,
        player: PlayerId,
        crc: u32,
    ) -> Result<(), LockstepError> {
        ensure_valid_frame(frame)?;
        ensure_valid_player(player, MAX_SLOTS)?;
        if self.game_logic_crcs.record_remote(frame, player, crc) {
            self.on_mismatch(DigestClass::GameLogicCrc, frame);
        }
        Ok(())
    }

    /// The local GameLogic CRC of `frame`.
    #[must_use]
    pub fn local_game_logic_crc(&self, frame: Frame) -> Option<u32> {
        self.game_logic_crcs.local(frame)
    }

    /// True if `frame` has a mismatched GameLogic CRC.
    #[must_use]
    pub fn is_game_logic_crc_mismatched(&self, frame: Frame) -> bool {
        self.game_logic_crcs.is_mismatched(frame)
    }

    /// Every frame with a mismatched GameLogic CRC, ascending.
    #[must_use]
    pub fn game_logic_crc_mismatched_frames(&self) -> Vec<Frame> {
        self.game_logic_crcs.mismatched_frames()
    }

    /// Frames whose GameLogic CRC cannot be validated yet against `expected`.
    #[must_use]
    pub fn pending_game_logic_crc_frames(&self, expected: &[PlayerId]) -> Vec<Frame> {
        self.game_logic_crcs.pending_validation_frames(expected)
    }

    /// Players in `expected` that have not reported a GameLogic CRC for `frame`.
    #[must_use]
    pub fn pending_game_logic_crc_players(&self, frame: Frame, expected: &[PlayerId]) -> PlayerSet {
        self.game_logic_crcs.pending_validation_players(frame, expected)
    }

    /// GameLogic CRC consensus for `frame` over `expected`, from the point of view of `self_id`.
    ///
    /// Mismatch if any expected remote CRC differs from the local one; otherwise pending while
    /// the local CRC or any expected remote CRC is missing; otherwise match.
    pub fn evaluate_game_logic_crc_consensus(
        &self,
        frame: Frame,
        expected: &[PlayerId],
        self_id: PlayerId,
    ) -> Result<ConsensusResult, LockstepError> {
        ensure_valid_frame(frame)?;
        Ok(self.game_logic_crcs.consensus(frame, expected, self_id))
    }

    /// Forgets GameLogic CRCs (and their mismatch state) before `frame`.
    pub fn prune_game_logic_crcs_before(&mut self, frame: Frame) {
        self.game_logic_crcs.prune_before(frame);
    }

    fn on_mismatch(&mut self, class: DigestClass, frame: Frame) {
        debug!("{} mismatch detected at frame {}", class, frame);
        let event = match class {
            DigestClass::FrameHash => KernelEvent::FrameHashMismatch { frame },
            DigestClass::GameLogicCrc => KernelEvent::GameLogicCrcMismatch { frame },
        };
        self.event_queue.push_back(event);
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Error,
            ViolationKind::DigestMismatch,
            frame,
            "{} mismatch: a remote peer disagrees with the local digest",
            class
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum DigestClass {
    FrameHash,
    GameLogicCrc,
}

impl fmt::Display for DigestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameHash => write!(f, "frame hash"),
            Self::GameLogicCrc => write!(f, "GameLogic CRC"),
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
    use crate::telemetry::CollectingObserver;
    use std::cell::RefCell;

    fn snapshot(commands: Vec<Command>) -> FrameSnapshot {
        FrameSnapshot::new(Frame::new(10), ObjectId::new(77), 0xdead_beef).with_commands(commands)
    }

    fn cmd(command_type: u32, player: u8, sort_number: u32) -> Command {
        Command::new(command_type, PlayerId::new(player), sort_number, vec![player; 3])
    }

    #[test]
    fn frame_metadata_hash_is_pure_and_order_sensitive() {
        let a = snapshot(vec![cmd(1, 0, 0), cmd(2, 1, 0)]);
        let b = snapshot(vec![cmd(2, 1, 0), cmd(1, 0, 0)]);
        assert_eq!(
            hash_deterministic_frame_metadata(&a),
            hash_deterministic_frame_metadata(&a.clone())
        );
        assert_ne!(
            hash_deterministic_frame_metadata(&a),
            hash_deterministic_frame_metadata(&b)
        );
    }

    #[test]
    fn frame_metadata_hash_covers_every_field() {
        let base = snapshot(vec![cmd(1, 0, 0)]);
        let base_hash = hash_deterministic_frame_metadata(&base);

        let mut changed = base.clone();
        changed.random_seed_crc ^= 1;
        assert_ne!(hash_deterministic_frame_metadata(&changed), base_hash);

        let mut changed = base.clone();
        changed.next_object_id = ObjectId::new(78);
        assert_ne!(hash_deterministic_frame_metadata(&changed), base_hash);

        let mut changed = base;
        changed.commands[0].payload.push(0);
        assert_ne!(hash_deterministic_frame_metadata(&changed), base_hash);
    }

    fn recording_writers<'a>(log: &'a RefCell<Vec<&'static str>>) -> GameLogicCrcSectionWriters<'a> {
        // Build through the fields in a scrambled order; the feed order must not care.
        GameLogicCrcSectionWriters {
            write_ai: Box::new(move |crc, _| {
                log.borrow_mut().push("ai");
                crc.add_unsigned_int(5);
            }),
            write_player_list: Box::new(move |crc, _| {
                log.borrow_mut().push("players");
                crc.add_unsigned_int(4);
            }),
            write_module_factory: Some(Box::new(move |crc, _| {
                log.borrow_mut().push("modules");
                crc.add_unsigned_int(3);
            })),
            write_partition_manager: Box::new(move |crc, _| {
                log.borrow_mut().push("partition");
                crc.add_unsigned_int(2);
            }),
            write_objects: Box::new(move |crc, snapshot| {
                log.borrow_mut().push("objects");
                crc.add_unsigned_int(snapshot.next_object_id.as_u32());
            }),
        }
    }

    #[test]
    fn game_logic_crc_sections_run_in_fixed_order() {
        let log = RefCell::new(Vec::new());
        let writers = recording_writers(&log);

        hash_deterministic_game_logic_crc(&snapshot(vec![]), &writers, CrcOptions::default())
            .unwrap();
        assert_eq!(*log.borrow(), vec!["objects", "partition", "players", "ai"]);

        log.borrow_mut().clear();
        hash_deterministic_game_logic_crc(
            &snapshot(vec![]),
            &writers,
            CrcOptions {
                include_module_factory: true,
            },
        )
        .unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["objects", "partition", "modules", "players", "ai"]
        );
    }

    #[test]
    fn game_logic_crc_feeds_markers() {
        let writers =
            GameLogicCrcSectionWriters::new(|_, _| {}, |_, _| {}, |_, _| {}, |_, _| {});
        let crc =
            hash_deterministic_game_logic_crc(&snapshot(vec![]), &writers, CrcOptions::default())
                .unwrap();

        let mut expected = CrcAccumulator::new();
        for marker in [
            MARKER_OBJECTS,
            MARKER_PARTITION_MANAGER,
            MARKER_PLAYER_LIST,
            MARKER_AI,
        ] {
            expected.add_ascii_string(marker);
        }
        assert_eq!(crc, expected.value());
    }

    #[test]
    fn module_factory_without_writer_is_a_configuration_error() {
        let called = RefCell::new(false);
        let writers = GameLogicCrcSectionWriters::new(
            |_, _| *called.borrow_mut() = true,
            |_, _| {},
            |_, _| {},
            |_, _| {},
        );
        let result = hash_deterministic_game_logic_crc(
            &snapshot(vec![]),
            &writers,
            CrcOptions {
                include_module_factory: true,
            },
        );
        assert_eq!(
            result,
            Err(LockstepError::MissingSectionWriter {
                section: MARKER_MODULE_FACTORY
            })
        );
        assert!(!*called.borrow());
    }

    #[test]
    fn frame_hash_mismatch_is_queued_and_reported_once() {
        let observer = Arc::new(CollectingObserver::new());
        let mut kernel = DeterministicStateKernel::new().with_observer(observer.clone());
        let frame = Frame::new(3);

        kernel.record_local_frame_hash(frame, 1).unwrap();
        kernel.record_remote_frame_hash(frame, PlayerId::new(1), 1).unwrap();
        assert_eq!(kernel.events().count(), 0);

        kernel.record_remote_frame_hash(frame, PlayerId::new(2), 2).unwrap();
        kernel.record_remote_frame_hash(frame, PlayerId::new(3), 3).unwrap();
        let events: Vec<_> = kernel.events().collect();
        assert_eq!(events, vec![KernelEvent::FrameHashMismatch { frame }]);
        assert_eq!(observer.violations_of_kind(ViolationKind::DigestMismatch).len(), 1);
        assert!(kernel.is_frame_hash_mismatched(frame));
        assert!(!kernel.is_game_logic_crc_mismatched(frame));
    }

    #[test]
    fn crc_mismatch_is_symmetric_in_arrival_order() {
        let mut kernel = DeterministicStateKernel::new();
        let frame = Frame::new(8);
        kernel.record_remote_game_logic_crc(frame, PlayerId::new(1), 0xbeef).unwrap();
        kernel.record_local_game_logic_crc(frame, 0xbeee).unwrap();
        assert_eq!(
            kernel.events().collect::<Vec<_>>(),
            vec![KernelEvent::GameLogicCrcMismatch { frame }]
        );
        assert_eq!(kernel.game_logic_crc_mismatched_frames(), vec![frame]);

        kernel.prune_game_logic_crcs_before(frame + 1);
        assert!(kernel.game_logic_crc_mismatched_frames().is_empty());
    }

    #[test]
    fn crc_consensus() {
        let mut kernel = DeterministicStateKernel::new();
        let frame = Frame::new(4);
        let players = [PlayerId::new(0), PlayerId::new(1)];
        kernel.record_local_game_logic_crc(frame, 7).unwrap();
        let result = kernel
            .evaluate_game_logic_crc_consensus(frame, &players, PlayerId::new(0))
            .unwrap();
        assert_eq!(result.status, ConsensusStatus::Pending);
        assert_eq!(result.missing.as_slice(), &[PlayerId::new(1)]);

        kernel.record_remote_game_logic_crc(frame, PlayerId::new(1), 7).unwrap();
        let result = kernel
            .evaluate_game_logic_crc_consensus(frame, &players, PlayerId::new(0))
            .unwrap();
        assert_eq!(result.status, ConsensusStatus::Match);
        assert!(kernel
            .evaluate_game_logic_crc_consensus(Frame::NULL, &players, PlayerId::new(0))
            .is_err());
    }

    #[test]
    fn arguments_are_validated() {
        let mut kernel = DeterministicStateKernel::new();
        assert!(matches!(
            kernel.record_local_frame_hash(Frame::new(-2), 0),
            Err(LockstepError::InvalidFrame { .. })
        ));
        assert!(matches!(
            kernel.record_remote_game_logic_crc(Frame::new(0), PlayerId::new(8), 0),
            Err(LockstepError::InvalidPlayer { .. })
        ));
    }

    #[test]
    fn object_ids_flow_through_the_kernel() {
        let mut kernel = DeterministicStateKernel::new();
        let first = kernel.allocate_object_id().unwrap();
        assert!(kernel.next_object_id() > first);
        kernel.set_next_object_id(ObjectId::new(500)).unwrap();
        assert_eq!(kernel.allocate_object_id().unwrap(), ObjectId::new(500));
        assert!(kernel.set_next_object_id(ObjectId::new(10)).is_err());
    }

    #[test]
    fn queue_through_the_kernel() {
        let mut kernel = DeterministicStateKernel::new();
        assert!(kernel.enqueue_command(cmd(4, 1, 40)));
        assert!(kernel.enqueue_command(cmd(7, 1, 5).with_dedupe_key("k")));
        assert!(!kernel.enqueue_command(cmd(7, 1, 5).with_dedupe_key("k")));
        assert!(kernel.enqueue_command(cmd(2, 3, 10)));
        let order: Vec<u32> = kernel.peek_commands().map(|c| c.command_type).collect();
        assert_eq!(order, vec![2, 4, 7]);
        assert_eq!(kernel.dequeue_command().unwrap().command_type, 2);
        assert_eq!(kernel.queued_command_count(), 2);
        assert!(kernel.has_seen_dedupe_key("k"));
    }
}
