//! Small datagram kinds recognised by the pool.

/// The bare holepunch probe.
pub const HOLEPUNCH: [u8; 1] = [0x00];

/// First byte of a preconnect notification.
pub const PRECONNECT_TAG: u8 = 0xff;

/// Length of a preconnect notification.
pub const PRECONNECT_LEN: usize = 5;

/// First byte of an encrypted stream frame.
pub const STREAM_TAG: u8 = 0xfe;

/// Encode a preconnect notification for `id`.
#[must_use]
pub fn preconnect(id: u32) -> [u8; PRECONNECT_LEN] {
    let mut out = [0u8; PRECONNECT_LEN];
    out[0] = PRECONNECT_TAG;
    out[1..].copy_from_slice(&id.to_le_bytes());
    out
}

/// Pairing id carried by a preconnect notification.
#[must_use]
pub fn parse_preconnect(data: &[u8]) -> Option<u32> {
    if data.len() != PRECONNECT_LEN || data[0] != PRECONNECT_TAG {
        return None;
    }
    let id: [u8; 4] = data[1..].try_into().ok()?;
    Some(u32::from_le_bytes(id))
}

/// Whether `data` looks like a stream frame.
#[must_use]
pub fn is_stream_frame(data: &[u8]) -> bool {
    data.len() > 1 && data[0] == STREAM_TAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preconnect_roundtrip() {
        assert_eq!(parse_preconnect(&preconnect(0xdead_beef)), Some(0xdead_beef));
    }

    #[test]
    fn test_preconnect_rejects_other_shapes() {
        assert_eq!(parse_preconnect(&HOLEPUNCH), None);
        assert_eq!(parse_preconnect(&[PRECONNECT_TAG, 1, 2, 3]), None);
        assert_eq!(parse_preconnect(&[STREAM_TAG, 1, 2, 3, 4]), None);
    }

    #[test]
    fn test_stream_frame_detection() {
        assert!(is_stream_frame(&[STREAM_TAG, 0]));
        assert!(!is_stream_frame(&[STREAM_TAG]));
        assert!(!is_stream_frame(&[0x13, 0]));
    }
}
