//! Fuzz target for sealed holepunch payloads
//!
//! Tests that opening arbitrary ciphertext under an arbitrary handshake
//! hash never panics and that plaintext parsing is total.

#![no_main]

use arbitrary::Arbitrary;
use burrow_crypto::Namespaces;
use burrow_discovery::{HolepunchCodec, HolepunchPayload};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct SealedInput {
    handshake_hash: [u8; 64],
    sealed: Vec<u8>,
}

fuzz_target!(|input: SealedInput| {
    let _ = HolepunchPayload::decode(&input.sealed);

    let codec = HolepunchCodec::new(&Namespaces::new(), &input.handshake_hash);
    if let Some(payload) = codec.decrypt(&input.sealed) {
        // Forged ciphertext must never authenticate; a hit is a real bug
        panic!("decrypted unauthenticated payload: {:?}", payload);
    }
});
