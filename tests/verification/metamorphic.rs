//! Metamorphic Testing for Fortress Lockstep
//!
//! Metamorphic testing verifies relationships between runs rather than specific expected
//! values. Two peers that receive the same traffic in a different order must end up in the
//! same state.
//!
//! # Test Categories
//!
//! 1. **Arrival Order Invariance**: permuted command arrival drains identically and hashes equal
//! 2. **Digest Symmetry**: local-first and remote-first recording detect the same mismatches
//! 3. **Fragmentation Invariance**: chunked and unchunked delivery decode to the same command

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use fortress_lockstep::*;
use proptest::prelude::*;

fn commands_strategy() -> impl Strategy<Value = Vec<Command>> {
    proptest::collection::vec((0u32..5, 0u8..4, 0u32..10), 1..24).prop_map(|keys| {
        keys.into_iter()
            .enumerate()
            .map(|(i, (command_type, player, sort_number))| {
                Command::new(command_type, PlayerId::new(player), sort_number, vec![i as u8])
                    .with_dedupe_key(format!("{player}:{sort_number}:{command_type}"))
            })
            .collect()
    })
}

fn drained_hash(commands: Vec<Command>) -> (Vec<Command>, u32) {
    let mut kernel = DeterministicStateKernel::new();
    for command in commands {
        kernel.enqueue_command(command);
    }
    let drained = kernel.drain_commands();
    let snapshot = FrameSnapshot::new(Frame::new(7), kernel.next_object_id(), 0xabcd)
        .with_commands(drained.clone());
    let hash = DeterministicStateKernel::hash_deterministic_frame_metadata(&snapshot);
    (drained, hash)
}

proptest! {
    /// Permuting arrival changes neither the drained order nor the frame hash, as long as
    /// duplicates carry identical content.
    #[test]
    fn meta_arrival_order_invariance(
        (original, shuffled) in commands_strategy().prop_flat_map(|commands| {
            // keep the first occurrence of each key so both runs admit the same commands
            let mut seen = std::collections::BTreeSet::new();
            let unique: Vec<Command> = commands
                .into_iter()
                .filter(|c| seen.insert(c.dedupe_key.clone()))
                .collect();
            (Just(unique.clone()), Just(unique).prop_shuffle())
        }),
    ) {
        let (a, hash_a) = drained_hash(original);
        let (b, hash_b) = drained_hash(shuffled);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(hash_a, hash_b);
    }

    /// The set of mismatched frames does not depend on whether local or remote digests come first.
    #[test]
    fn meta_digest_symmetry(
        records in proptest::collection::vec((0i32..10, 1u8..4, 0u32..3, 0u32..3), 1..40),
    ) {
        // one remote digest per (frame, player)
        let mut seen = std::collections::BTreeSet::new();
        let records: Vec<_> = records
            .into_iter()
            .filter(|(frame, player, _, _)| seen.insert((*frame, *player)))
            .collect();
        let mut local_first = DeterministicStateKernel::new();
        let mut remote_first = DeterministicStateKernel::new();
        for (frame, player, local, remote) in &records {
            let frame = Frame::new(*frame);
            let player = PlayerId::new(*player);
            if local_first.local_frame_hash(frame).is_none() {
                local_first.record_local_frame_hash(frame, *local).unwrap();
            }
            local_first.record_remote_frame_hash(frame, player, *remote).unwrap();
        }
        for (frame, player, _, remote) in &records {
            remote_first
                .record_remote_frame_hash(Frame::new(*frame), PlayerId::new(*player), *remote)
                .unwrap();
        }
        for (frame, _, local, _) in &records {
            let frame = Frame::new(*frame);
            if remote_first.local_frame_hash(frame).is_none() {
                remote_first.record_local_frame_hash(frame, *local).unwrap();
            }
        }
        prop_assert_eq!(
            local_first.frame_hash_mismatched_frames(),
            remote_first.frame_hash_mismatched_frames()
        );
        let a = local_first.events().count();
        let b = remote_first.events().count();
        prop_assert_eq!(a, b);
        prop_assert_eq!(a, local_first.frame_hash_mismatched_frames().len());
    }

    /// Delivering a command through wrapper chunks yields the same command as sending it whole.
    #[test]
    fn meta_fragmentation_invariance(
        payload in proptest::collection::vec(any::<u8>(), 0..400),
        chunk_size in 1usize..100,
    ) {
        let command = NetCommand::new(
            CommandHeader { frame: 3, player_id: 1, relay: 0, command_id: Some(9) },
            CommandBody::GameCommand { message_type: 77, payload },
        );
        let whole = encode_command(&command).unwrap();

        let mut assembler = WrapperAssembler::default();
        let mut reassembled = None;
        for chunk in split_into_chunks(5, &whole, chunk_size).unwrap() {
            if let AssemblyProgress::Complete(bytes) = assembler.add_chunk(&chunk).unwrap() {
                reassembled = Some(bytes);
            }
        }
        let reassembled = reassembled.unwrap();
        prop_assert_eq!(decode_command(&reassembled), decode_command(&whole));
        prop_assert_eq!(decode_command(&whole), Some(command));
    }
}
