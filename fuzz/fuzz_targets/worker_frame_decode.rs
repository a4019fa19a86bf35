//! Fuzz target for WorkerFrame::decode
//!
//! Worker sockets carry bytes from sandboxed processes, so the decoder must
//! treat its input as hostile:
//! - No panics on truncated or oversized length prefixes
//! - Unknown kind bytes are rejected, not mapped
//! - A frame that decodes re-encodes to the same leading bytes

#![no_main]

use cowrite_server::worker::{LENGTH_SIZE, WorkerFrame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = WorkerFrame::decode(data) else {
        return;
    };

    let mut encoded = Vec::new();
    frame.encode(&mut encoded).expect("decoded frame must re-encode");
    assert!(encoded.len() > LENGTH_SIZE);
    assert_eq!(&data[..encoded.len()], &encoded[..]);
    assert_eq!(WorkerFrame::decode(&encoded).expect("round trip"), frame);
});
