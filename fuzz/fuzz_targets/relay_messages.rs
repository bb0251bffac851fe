//! Fuzz target for relayed DHT message values
//!
//! Every value a router or server decodes arrives from an untrusted node.

#![no_main]

use burrow_discovery::messages::{AnnounceMessage, ConnectMessage, HandshakePayload, HolepunchMessage, PeerRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = ConnectMessage::decode(data);
    let _ = HolepunchMessage::decode(data);
    let _ = PeerRecord::decode(data);
    let _ = AnnounceMessage::decode(data);

    // Anything that decodes must survive a second pass unchanged
    if let Ok(payload) = HandshakePayload::decode(data) {
        let again = HandshakePayload::decode(&payload.encode());
        assert_eq!(again.ok(), Some(payload));
    }
});
