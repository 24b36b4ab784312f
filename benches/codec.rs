//! Benchmarks for the command codec, chunk reassembly and frame hashing
//!
//! Run with: cargo bench --bench codec
//!
//! The streams mimic one peer's packet for a frame: a burst of game commands followed by
//! the FRAMEINFO that announces their count.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fortress_lockstep::{
    decode_command_stream, encode_command, encode_command_stream, split_into_chunks,
    AssemblyProgress, Command, CommandBody, CommandHeader, DeterministicStateKernel, Frame,
    FrameSnapshot, NetCommand, ObjectId, PlayerId, WrapperAssembler,
};
use std::hint::black_box;

/// One frame's worth of commands from one player
fn frame_stream(commands: usize, payload_size: usize) -> Vec<NetCommand> {
    let mut stream: Vec<NetCommand> = (0..commands)
        .map(|i| {
            NetCommand::new(
                CommandHeader {
                    frame: 120,
                    player_id: 3,
                    relay: 0,
                    command_id: Some(64001 + i as u16),
                },
                CommandBody::GameCommand {
                    message_type: (i % 7) as u32,
                    payload: vec![(i % 251) as u8; payload_size],
                },
            )
        })
        .collect();
    stream.push(NetCommand::new(
        CommandHeader {
            frame: 120,
            player_id: 3,
            relay: 0,
            command_id: None,
        },
        CommandBody::FrameInfo {
            command_count: commands as u16,
        },
    ));
    stream
}

fn bench_stream_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_encode");
    for commands in [1, 8, 64] {
        let stream = frame_stream(commands, 16);
        group.throughput(Throughput::Elements(stream.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(commands), &stream, |b, stream| {
            b.iter(|| encode_command_stream(black_box(stream)));
        });
    }
    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");
    for commands in [1, 8, 64] {
        let bytes = encode_command_stream(&frame_stream(commands, 16)).unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(commands), &bytes, |b, bytes| {
            b.iter(|| decode_command_stream(black_box(bytes)));
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    for size in [256usize, 4096, 65536] {
        let command = NetCommand::new(
            CommandHeader::default(),
            CommandBody::GameCommand {
                message_type: 1,
                payload: vec![0xa5; size.min(u16::MAX as usize)],
            },
        );
        let inner = encode_command(&command).unwrap_or_default();
        let mut chunks = split_into_chunks(7, &inner, 480).unwrap_or_default();
        chunks.reverse();
        group.throughput(Throughput::Bytes(inner.len() as u64));
        group.bench_with_input(BenchmarkId::new("reversed", size), &chunks, |b, chunks| {
            b.iter(|| {
                let mut assembler = WrapperAssembler::default();
                let mut done = None;
                for chunk in chunks {
                    if let Ok(AssemblyProgress::Complete(bytes)) = assembler.add_chunk(chunk) {
                        done = Some(bytes);
                    }
                }
                black_box(done)
            });
        });
    }
    group.finish();
}

fn bench_frame_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_hash");
    for commands in [0usize, 16, 256] {
        let list: Vec<Command> = (0..commands)
            .map(|i| Command::new(i as u32 % 5, PlayerId::new((i % 8) as u8), i as u32, vec![0; 24]))
            .collect();
        let snapshot = FrameSnapshot::new(Frame::new(900), ObjectId::new(5000), 0x1234_5678)
            .with_commands(list);
        group.throughput(Throughput::Elements(commands as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(commands),
            &snapshot,
            |b, snapshot| {
                b.iter(|| {
                    DeterministicStateKernel::hash_deterministic_frame_metadata(black_box(snapshot))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_stream_encode,
    bench_stream_decode,
    bench_reassembly,
    bench_frame_hash
);
criterion_main!(benches);
