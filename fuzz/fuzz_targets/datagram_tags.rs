//! Fuzz target for raw datagram classification on pool sockets

#![no_main]

use burrow_transport::wire::{is_stream_frame, parse_preconnect, preconnect};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let stream = is_stream_frame(data);
    if let Some(id) = parse_preconnect(data) {
        assert!(!stream);
        assert_eq!(parse_preconnect(&preconnect(id)), Some(id));
    }
});
