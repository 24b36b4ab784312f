//! Property-based tests for the lockstep components.
//!
//! These tests use proptest to verify invariants hold under random inputs,
//! leveraging the exposed __internal module for direct component testing.
//!
//! # Properties Tested
//!
//! - The command queue is observed in ascending order key and inserts each dedupe key once
//! - Object ids strictly increase from the first id
//! - Any split and any arrival order of wrapper chunks reassembles the original payload
//! - Resend plans never reach behind the retention window; pruning is idempotent
//! - Stream decoding never panics on arbitrary bytes
//! - Translated slots invert
//! - Issued command ids are wrapping-increasing
//! - Disconnect votes reach quorum exactly at a strict majority

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use fortress_lockstep::__internal::{CommandQueue, DisconnectVotes, ObjectIdAllocator};
use fortress_lockstep::network::command_ids::sequence_greater_than;
use fortress_lockstep::{
    decode_command_stream, decode_wrapper_chunk, encode_command_stream, encode_wrapper_chunk,
    from_translated_slot, split_into_chunks, to_translated_slot, ArchiveConfig, AssemblyProgress,
    Command, CommandBody, CommandHeader, CommandIdConfig, CommandIdSequencer, Frame,
    FrameResendArchive, NetCommand, PlayerId, WrapperAssembler, FIRST_OBJECT_ID, MAX_SLOTS,
};
use proptest::prelude::*;

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Strategy for a command with a small key space so that ties and duplicates happen.
fn command_strategy() -> impl Strategy<Value = Command> {
    (0u32..4, 0u8..4, 0u32..6, proptest::option::of(0u8..8)).prop_map(
        |(command_type, player, sort_number, key)| {
            let command = Command::new(command_type, PlayerId::new(player), sort_number, vec![]);
            match key {
                Some(key) => command.with_dedupe_key(format!("k{key}")),
                None => command,
            }
        },
    )
}

fn game_command_strategy() -> impl Strategy<Value = NetCommand> {
    (
        0u32..1000,
        0u8..8,
        proptest::option::of(any::<u16>()),
        any::<u32>(),
        proptest::collection::vec(any::<u8>(), 0..32),
    )
        .prop_map(|(frame, player_id, command_id, message_type, payload)| {
            NetCommand::new(
                CommandHeader {
                    frame,
                    player_id,
                    relay: 0,
                    command_id,
                },
                CommandBody::GameCommand {
                    message_type,
                    payload,
                },
            )
        })
}

proptest! {
    /// The queue is always observed sorted, and a dedupe key is admitted once.
    #[test]
    fn prop_command_queue_sorted_and_deduped(
        commands in proptest::collection::vec(command_strategy(), 0..64),
    ) {
        let mut queue = CommandQueue::new();
        let mut seen_keys = std::collections::BTreeSet::new();
        let mut admitted = 0;
        for command in commands {
            let fresh_key = command.dedupe_key.clone().is_none_or(|k| seen_keys.insert(k));
            let inserted = queue.enqueue(command);
            prop_assert_eq!(inserted, fresh_key);
            admitted += usize::from(inserted);

            let keys: Vec<_> = queue.iter().map(Command::sort_key).collect();
            prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        }
        prop_assert_eq!(queue.len(), admitted);
        let drained = queue.drain();
        prop_assert!(drained.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
    }

    /// Object ids never regress or repeat.
    #[test]
    fn prop_object_ids_strictly_increase(count in 1usize..200) {
        let mut ids = ObjectIdAllocator::new();
        let mut previous = None;
        for _ in 0..count {
            let id = ids.allocate().unwrap();
            match previous {
                None => prop_assert_eq!(id, FIRST_OBJECT_ID),
                Some(prev) => prop_assert!(id > prev),
            }
            previous = Some(id);
        }
    }

    /// Every split in every order reassembles to the original bytes, and each chunk survives
    /// the envelope codec.
    #[test]
    fn prop_reassembly_is_order_independent(
        payload in proptest::collection::vec(any::<u8>(), 0..300),
        chunk_size in 1usize..64,
        seed in any::<u64>(),
        duplicate in any::<bool>(),
    ) {
        let mut chunks = split_into_chunks(42, &payload, chunk_size).unwrap();
        // deterministic shuffle
        let len = chunks.len();
        for i in 0..len {
            let j = (seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64) % len as u64) as usize;
            chunks.swap(i, j);
        }
        if duplicate {
            let first = chunks[0].clone();
            chunks.insert(len / 2, first);
        }

        let mut assembler = WrapperAssembler::default();
        let mut complete = None;
        for chunk in &chunks {
            let bytes = encode_wrapper_chunk(chunk).unwrap();
            let decoded = decode_wrapper_chunk(&bytes).unwrap();
            prop_assert_eq!(&decoded, chunk);
            if complete.is_some() {
                // a late duplicate starts a new assembly; it must not complete again
                continue;
            }
            if let AssemblyProgress::Complete(bytes) = assembler.add_chunk(&decoded).unwrap() {
                complete = Some(bytes);
            }
        }
        prop_assert_eq!(complete, Some(payload));
    }

    /// Resend plans stay inside the retention window and pruning twice changes nothing.
    #[test]
    fn prop_archive_window_bounded(
        keep in 1i32..20,
        current in 0i32..100,
        start in 0i32..100,
        recorded in proptest::collection::vec((0i32..100, 0u8..4), 0..80),
    ) {
        let mut archive = FrameResendArchive::new(ArchiveConfig { frames_to_keep: keep });
        for (frame, player) in recorded {
            let command = NetCommand::new(CommandHeader::default(), CommandBody::KeepAlive);
            archive.record_command(PlayerId::new(player), Frame::new(frame), command).unwrap();
        }
        let connected: Vec<PlayerId> = (0..4).map(PlayerId::new).collect();
        let plan = archive
            .build_resend_plan(PlayerId::new(0), Frame::new(start), Frame::new(current), &connected)
            .unwrap();
        for frame in &plan.frames {
            prop_assert!(frame.frame >= Frame::new(current).saturating_sub(keep));
            prop_assert!(frame.frame >= Frame::new(start));
            prop_assert!(frame.frame < Frame::new(current));
            prop_assert!(frame.senders.iter().all(|s| s.player != PlayerId::new(0)));
        }

        archive.prune_history(Frame::new(current));
        let once = archive.len();
        let oldest = archive.oldest_frame();
        archive.prune_history(Frame::new(current));
        prop_assert_eq!(archive.len(), once);
        prop_assert_eq!(archive.oldest_frame(), oldest);
    }

    /// Arbitrary bytes never panic the stream decoder.
    #[test]
    fn prop_stream_decoding_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_command_stream(&bytes);
        let _ = decode_wrapper_chunk(&bytes);
    }

    /// Streams of game commands decode to what was encoded, whatever header fields repeat.
    #[test]
    fn prop_command_stream_preserves_commands(
        commands in proptest::collection::vec(game_command_strategy(), 1..12),
    ) {
        let bytes = encode_command_stream(&commands).unwrap();
        prop_assert_eq!(decode_command_stream(&bytes), Some(commands));
    }

    /// Translated slots invert for every local slot.
    #[test]
    fn prop_translated_slots_invert(slot in 0u8..MAX_SLOTS as u8, local in 0u8..MAX_SLOTS as u8) {
        let (slot, local) = (PlayerId::new(slot), PlayerId::new(local));
        match to_translated_slot(slot, local) {
            Some(translated) => {
                prop_assert!(usize::from(translated) < MAX_SLOTS - 1);
                prop_assert_eq!(from_translated_slot(translated, local), Some(slot));
            },
            None => prop_assert_eq!(slot, local),
        }
    }

    /// Consecutive ids compare as increasing across wraparound, as long as acks keep up.
    #[test]
    fn prop_command_ids_wrap_increasing(seed in any::<u16>(), count in 1usize..300) {
        let mut ids = CommandIdSequencer::new(CommandIdConfig { seed, max_outstanding: 16 });
        let mut previous = seed;
        for _ in 0..count {
            let id = ids.next_command_id().unwrap();
            prop_assert!(sequence_greater_than(id, previous));
            ids.track_pending_ack(id).unwrap();
            if ids.outstanding_len() > 8 {
                let oldest = ids.oldest_outstanding().unwrap();
                prop_assert!(ids.acknowledge(oldest));
            }
            previous = id;
        }
    }

    /// A candidate is voted out exactly when a strict majority of the others voted.
    #[test]
    fn prop_vote_quorum_is_strict_majority(num_players in 2u8..=8, votes in 0u8..8) {
        let connected: Vec<PlayerId> = (0..num_players).map(PlayerId::new).collect();
        let candidate = PlayerId::new(num_players - 1);
        let others = usize::from(num_players - 1);
        let cast = usize::from(votes).min(others);

        let mut tally = DisconnectVotes::new();
        for caster in 0..cast {
            tally.cast(candidate, Frame::new(3), PlayerId::new(caster as u8));
        }
        prop_assert_eq!(
            tally.is_voted_out(candidate, Frame::new(3), &connected),
            cast * 2 > others
        );
    }
}
