//! Fuzz target for wrapped-command reassembly.
//!
//! Feeds arbitrary chunk sequences (overlapping, out of bounds, conflicting totals) into a
//! `WrapperAssembler`.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary chunks
//! - Pending assemblies never exceed the configured limit
//! - A completed payload has exactly the announced length

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use fortress_lockstep::{AssemblyConfig, AssemblyProgress, WrapperAssembler, WrapperChunk};

#[derive(Debug, Arbitrary)]
struct FuzzChunk {
    wrapped_command_id: u8,
    total_data_length: u16,
    data_offset: u16,
    data: Vec<u8>,
}

fuzz_target!(|chunks: Vec<FuzzChunk>| {
    let config = AssemblyConfig {
        max_total_length: 4096,
        max_pending: 8,
    };
    let mut assembler = WrapperAssembler::new(config);

    for chunk in chunks {
        let data_length = chunk.data.len() as u32;
        let total = u32::from(chunk.total_data_length);
        let chunk = WrapperChunk {
            wrapped_command_id: u16::from(chunk.wrapped_command_id),
            chunk_number: 0,
            num_chunks: 1,
            total_data_length: total,
            data_length,
            data_offset: u32::from(chunk.data_offset),
            data: chunk.data,
        };
        if let Ok(AssemblyProgress::Complete(payload)) = assembler.add_chunk(&chunk) {
            assert_eq!(payload.len(), total as usize);
            assert!(!assembler.is_pending(chunk.wrapped_command_id));
        }
        assert!(assembler.pending_len() <= config.max_pending);
    }
});
