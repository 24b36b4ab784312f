//! Fuzz target for command stream decoding.
//!
//! This target tests that arbitrary bytes cannot crash the marker-stream decoder.
//! Malformed data must yield `None`, never a panic or a partial result.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - No unbounded memory allocation
//! - Anything that decodes re-encodes, and the re-encoding is stable (compared as bytes,
//!   since float fields may hold NaN)

#![no_main]

use libfuzzer_sys::fuzz_target;

use fortress_lockstep::{decode_command_stream, decode_wrapper_chunk, encode_command_stream};

fuzz_target!(|data: &[u8]| {
    let _ = decode_wrapper_chunk(data);

    if let Some(commands) = decode_command_stream(data) {
        if let Ok(bytes) = encode_command_stream(&commands) {
            let again = decode_command_stream(&bytes).expect("re-encoded stream decodes");
            assert_eq!(encode_command_stream(&again).ok(), Some(bytes));
        }
    }
});
