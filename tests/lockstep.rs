//! End-to-end flows through the lockstep core: bytes in, ordered commands, digests,
//! readiness, resends and disconnects out.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::{Arc, Once};

use fortress_lockstep::network::adapter::command_from_wire;
use fortress_lockstep::telemetry::CollectingObserver;
use fortress_lockstep::*;
use web_time::{Duration, Instant};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn p(id: u8) -> PlayerId {
    PlayerId::new(id)
}

fn game_command(frame: u32, player: u8, command_id: u16, message_type: u32) -> NetCommand {
    NetCommand::new(
        CommandHeader {
            frame,
            player_id: player,
            relay: 0,
            command_id: Some(command_id),
        },
        CommandBody::GameCommand {
            message_type,
            payload: vec![player, command_id as u8],
        },
    )
}

fn frame_info(frame: u32, player: u8, count: u16) -> NetCommand {
    NetCommand::new(
        CommandHeader {
            frame,
            player_id: player,
            relay: 0,
            command_id: None,
        },
        CommandBody::FrameInfo {
            command_count: count,
        },
    )
}

/// One simulated peer: the kernel and frame state, fed with decoded wire commands.
struct Peer {
    kernel: DeterministicStateKernel,
    frames: DeterministicFrameState,
    assembler: WrapperAssembler,
}

impl Peer {
    fn new(num_slots: usize, local: u8) -> Self {
        let config = DisconnectConfig {
            num_slots,
            ..DisconnectConfig::default()
        };
        Self {
            kernel: DeterministicStateKernel::new(),
            frames: DeterministicFrameState::new(config, p(local)).unwrap(),
            assembler: WrapperAssembler::default(),
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        for command in decode_command_stream(bytes).expect("well-formed stream") {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: NetCommand) {
        let frame = Frame::from_wire(command.header.frame).unwrap();
        let player = p(command.header.player_id);
        match &command.body {
            CommandBody::FrameInfo { command_count } => {
                self.frames
                    .set_expected_command_count(player, frame, u32::from(*command_count))
                    .unwrap();
            },
            CommandBody::Wrapper(chunk) => {
                if let AssemblyProgress::Complete(bytes) = self.assembler.add_chunk(chunk).unwrap() {
                    let inner = decode_command(&bytes).expect("reassembled command decodes");
                    self.handle(inner);
                }
            },
            _ => {
                if CommandRequirements::of(command.command_type()).is_synchronized {
                    let converted = command_from_wire(&command).unwrap();
                    if self.kernel.enqueue_command(converted) {
                        self.frames.record_command_received(player, frame).unwrap();
                    }
                }
            },
        }
    }
}

#[test]
fn peers_agree_on_order_and_frame_hash() {
    init_tracing();
    let frame = 4;
    let from_one = encode_command_stream(&[
        game_command(frame, 1, 64001, 20),
        game_command(frame, 1, 64002, 10),
        frame_info(frame, 1, 2),
    ])
    .unwrap();
    let from_two = encode_command_stream(&[
        game_command(frame, 2, 64001, 10),
        frame_info(frame, 2, 1),
    ])
    .unwrap();
    let from_zero = encode_command_stream(&[frame_info(frame, 0, 0)]).unwrap();

    // peers see the packets in different orders
    let mut alice = Peer::new(3, 0);
    let mut bob = Peer::new(3, 1);
    for bytes in [&from_one, &from_two, &from_zero] {
        alice.receive(bytes);
    }
    for bytes in [&from_zero, &from_two, &from_one, &from_two] {
        bob.receive(bytes);
    }

    let f = Frame::new(frame as i32);
    assert!(alice.frames.evaluate_frame_execution_readiness(f).unwrap().can_execute());
    assert!(bob.frames.evaluate_frame_execution_readiness(f).unwrap().can_execute());

    let alice_commands = alice.kernel.drain_commands();
    let bob_commands = bob.kernel.drain_commands();
    assert_eq!(alice_commands, bob_commands);
    let keys: Vec<_> = alice_commands.iter().map(Command::sort_key).collect();
    assert_eq!(keys, vec![(10, p(1), 2), (10, p(2), 1), (20, p(1), 1)]);

    let hash_of = |commands: Vec<Command>| {
        let snapshot = FrameSnapshot::new(f, ObjectId::new(1), 0xfeed).with_commands(commands);
        DeterministicStateKernel::hash_deterministic_frame_metadata(&snapshot)
    };
    let alice_hash = hash_of(alice_commands);
    let bob_hash = hash_of(bob_commands);
    alice.kernel.record_local_frame_hash(f, alice_hash).unwrap();
    alice.kernel.record_remote_frame_hash(f, p(1), bob_hash).unwrap();
    alice.kernel.record_remote_frame_hash(f, p(2), bob_hash).unwrap();
    let consensus = alice
        .kernel
        .evaluate_frame_hash_consensus(f, &[p(0), p(1), p(2)], p(0))
        .unwrap();
    assert_eq!(consensus.status, ConsensusStatus::Match);
    assert_eq!(alice.kernel.events().len(), 0);
}

#[test]
fn wrapped_command_arrives_in_shuffled_chunks() {
    init_tracing();
    let big = NetCommand::new(
        CommandHeader {
            frame: 9,
            player_id: 2,
            relay: 0,
            command_id: Some(7),
        },
        CommandBody::GameCommand {
            message_type: 3,
            payload: (0..=255).collect(),
        },
    );
    let inner = encode_command(&big).unwrap();
    let mut chunks = split_into_chunks(99, &inner, 40).unwrap();
    chunks.reverse();
    let wrapped: Vec<NetCommand> = chunks
        .into_iter()
        .map(|chunk| {
            NetCommand::new(
                CommandHeader {
                    frame: 9,
                    player_id: 2,
                    relay: 0,
                    command_id: None,
                },
                CommandBody::Wrapper(chunk),
            )
        })
        .collect();
    let bytes = encode_command_stream(&wrapped).unwrap();

    let mut peer = Peer::new(3, 0);
    peer.receive(&bytes);
    assert_eq!(peer.assembler.pending_len(), 0);
    assert_eq!(peer.kernel.queued_command_count(), 1);
    let command = peer.kernel.dequeue_command().unwrap();
    assert_eq!(command.payload.len(), 256);
    assert_eq!(command.dedupe_key.as_deref(), Some("2:9:7"));
}

#[test]
fn desync_is_reported_once_with_violation() {
    init_tracing();
    let observer = Arc::new(CollectingObserver::new());
    let mut kernel = DeterministicStateKernel::new().with_observer(observer.clone());
    let frame = Frame::new(12);

    kernel.record_remote_game_logic_crc(frame, p(1), 0xdead).unwrap();
    kernel.record_remote_game_logic_crc(frame, p(2), 0xbeef).unwrap();
    kernel.record_local_game_logic_crc(frame, 0xbeef).unwrap();

    let events: Vec<_> = kernel.events().collect();
    assert_eq!(events, vec![KernelEvent::GameLogicCrcMismatch { frame }]);
    assert_eq!(
        observer
            .violations_of_kind(telemetry::ViolationKind::DigestMismatch)
            .len(),
        1
    );
    let consensus = kernel
        .evaluate_game_logic_crc_consensus(frame, &[p(1), p(2)], p(0))
        .unwrap();
    assert_eq!(consensus.status, ConsensusStatus::Mismatch);
    assert_eq!(consensus.mismatched.as_slice(), &[p(1)]);
}

#[test]
fn lagging_peer_catches_up_from_the_archive() {
    init_tracing();
    let mut archive = FrameResendArchive::new(ArchiveConfig { frames_to_keep: 5 });
    for frame in 0..20u32 {
        for player in [0u8, 1] {
            let f = Frame::new(frame as i32);
            archive
                .record_command(p(player), f, game_command(frame, player, frame as u16, 1))
                .unwrap();
            archive.set_expected_count(p(player), f, 1).unwrap();
        }
    }
    archive.prune_history(Frame::new(20));

    let plan = archive
        .build_resend_plan(p(2), Frame::new(0), Frame::new(20), &[p(0), p(1), p(2)])
        .unwrap();
    let frames: Vec<i32> = plan.frames.iter().map(|f| f.frame.as_i32()).collect();
    assert_eq!(frames, vec![15, 16, 17, 18, 19]);

    // the lagging peer replays the plan and becomes ready for every resent frame
    let mut lagging = Peer::new(3, 2);
    let bytes = encode_command_stream(&plan.into_commands()).unwrap();
    lagging.receive(&bytes);
    for frame in 15..20 {
        let f = Frame::new(frame);
        lagging.frames.set_expected_command_count(p(2), f, 0).unwrap();
        assert!(lagging.frames.evaluate_frame_readiness(f).can_execute(), "frame {frame}");
    }
}

#[test]
fn stalled_match_votes_out_a_silent_player() {
    init_tracing();
    let config = DisconnectConfig {
        num_slots: 4,
        stall_timeout: Duration::from_secs(2),
        keepalive_interval: Duration::from_millis(250),
        player_timeout: Duration::from_secs(20),
        packet_router_timeout: Duration::from_secs(5),
    };
    let mut router = DeterministicFrameState::new(config, p(0)).unwrap();
    let frame = Frame::new(100);
    let t0 = Instant::now();

    assert_eq!(router.evaluate_disconnect_stall(t0, true), StallUpdate::Waiting);
    assert_eq!(
        router.evaluate_disconnect_stall(t0 + Duration::from_secs(2), true),
        StallUpdate::IndicatorOn
    );
    assert_eq!(router.continuation_state(), ContinuationState::ScreenOn);

    // everyone but player 3 reports the frame they are stuck at and votes
    for player in [0u8, 1, 2] {
        router.record_disconnect_frame(p(player), frame).unwrap();
        router.cast_disconnect_vote(p(3), frame, p(player)).unwrap();
    }
    assert!(router.is_disconnect_slot_voted_out(p(3), frame));
    let status = router.evaluate_disconnect_status(t0 + Duration::from_secs(3));
    assert!(!status.all_on_same_frame);
    assert!(status.players_to_disconnect.is_empty());

    // player 3 eventually reports the same frame; now the router decides
    router.record_disconnect_frame(p(3), frame).unwrap();
    let status = router.evaluate_disconnect_status(t0 + Duration::from_secs(3));
    assert!(status.all_on_same_frame);
    assert!(status.local_is_packet_router);
    assert_eq!(status.players_to_disconnect.as_slice(), &[p(3)]);

    router.disconnect_player(p(3)).unwrap();
    for player in [0u8, 1, 2] {
        router.set_expected_command_count(p(player), frame, 0).unwrap();
    }
    assert!(router.evaluate_frame_execution_readiness(frame).unwrap().can_execute());
    assert_eq!(router.continuation_state(), ContinuationState::ScreenOff);
    let events: Vec<_> = router.events().collect();
    assert_eq!(
        events,
        vec![
            FrameStateEvent::StallIndicatorOn,
            FrameStateEvent::DisconnectScreenOff { frame }
        ]
    );
}

#[test]
fn game_loop_is_gated_by_readiness() {
    init_tracing();
    use std::cell::RefCell;
    use std::rc::Rc;

    let state = Rc::new(RefCell::new(
        DeterministicFrameState::new(
            DisconnectConfig {
                num_slots: 2,
                ..DisconnectConfig::default()
            },
            p(0),
        )
        .unwrap(),
    ));
    let executed = Rc::new(RefCell::new(Vec::new()));
    let (gate_state, sink) = (Rc::clone(&state), Rc::clone(&executed));
    let mut game_loop = GameLoop::new(
        ManualScheduler::new(),
        GameLoopConfig {
            simulation_hz: 10,
            ..GameLoopConfig::default()
        },
        move |step| {
            let frame = Frame::new(step as i32);
            let mut state = gate_state.borrow_mut();
            if state.evaluate_frame_execution_readiness(frame).unwrap().can_execute() {
                sink.borrow_mut().push(frame);
            }
        },
        |_alpha| {},
    )
    .unwrap();

    for player in [0u8, 1] {
        state
            .borrow_mut()
            .set_expected_command_count(p(player), Frame::new(1), 0)
            .unwrap();
    }
    game_loop.start();
    game_loop.scheduler_mut().advance(Duration::from_millis(250));
    assert_eq!(game_loop.tick(), 2);
    assert_eq!(*executed.borrow(), vec![Frame::new(1)]);
}
