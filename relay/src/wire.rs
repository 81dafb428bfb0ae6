use orepool_core::Share;
use thiserror::Error;

/// Low bits of the flags word select the payload encoding. The remaining
/// bits are reserved for forward-compatible additions and ignored here.
pub const WIRE_FORMAT_MASK: u32 = 0xF;

const FORMAT_JSON: u32 = 1;
const FORMAT_BINARY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// camelCase JSON, the cross-language default.
    Json,
    /// Compact borsh encoding.
    Binary,
}

impl WireFormat {
    pub fn flags(&self) -> u32 {
        match self {
            WireFormat::Json => FORMAT_JSON,
            WireFormat::Binary => FORMAT_BINARY,
        }
    }

    fn from_masked(bits: u32) -> Option<Self> {
        match bits {
            FORMAT_JSON => Some(WireFormat::Json),
            FORMAT_BINARY => Some(WireFormat::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("flags frame must be 4 bytes, got {0}")]
    BadFlagsFrame(usize),
    #[error("unknown wire format in flags {0:#010x}")]
    UnknownFormat(u32),
    #[error("payload decode failed: {0}")]
    Decode(String),
    #[error("payload encode failed: {0}")]
    Encode(String),
}

/// Interpret a received flags frame. Legacy publishers send the word in
/// reversed byte order; when the format bits mask to zero we reverse and
/// retry once, and only that quirk is tolerated.
pub fn parse_flags(frame: &[u8]) -> Result<(u32, WireFormat), WireError> {
    let bytes: [u8; 4] = frame.try_into().map_err(|_| WireError::BadFlagsFrame(frame.len()))?;
    let flags = u32::from_be_bytes(bytes);
    if let Some(format) = WireFormat::from_masked(flags & WIRE_FORMAT_MASK) {
        return Ok((flags, format));
    }
    let reversed = u32::from_le_bytes(bytes);
    if let Some(format) = WireFormat::from_masked(reversed & WIRE_FORMAT_MASK) {
        tracing::debug!("flags word arrived byte-reversed ({:#010x}), legacy publisher assumed", flags);
        return Ok((reversed, format));
    }
    Err(WireError::UnknownFormat(flags))
}

pub fn encode_share(share: &Share, format: WireFormat) -> Result<Vec<u8>, WireError> {
    match format {
        WireFormat::Json => serde_json::to_vec(share).map_err(|e| WireError::Encode(e.to_string())),
        WireFormat::Binary => borsh::to_vec(share).map_err(|e| WireError::Encode(e.to_string())),
    }
}

pub fn decode_share(payload: &[u8], format: WireFormat) -> Result<Share, WireError> {
    match format {
        WireFormat::Json => serde_json::from_slice(payload).map_err(|e| WireError::Decode(e.to_string())),
        WireFormat::Binary => borsh::from_slice(payload).map_err(|e| WireError::Decode(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_share() -> Share {
        Share {
            pool_id: "xmr1".into(),
            worker: "wallet.rig1".into(),
            miner_address: Some("wallet".into()),
            claimed_difficulty: 16.0,
            actual_difficulty: 17.25,
            network_difficulty: 1e9,
            block_height: 42,
            is_block_candidate: false,
            source: "A".into(),
            created_ms: 1_700_000_000_000,
            nonce: Some("0x1234".into()),
            mix_hash: None,
            transaction_hash: None,
        }
    }

    #[test]
    fn binary_round_trip_preserves_fields() {
        let share = sample_share();
        let payload = encode_share(&share, WireFormat::Binary).unwrap();
        let decoded = decode_share(&payload, WireFormat::Binary).unwrap();
        assert_eq!(decoded, share);
    }

    #[test]
    fn json_payload_uses_camel_case() {
        let payload = encode_share(&sample_share(), WireFormat::Json).unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(text.contains("\"poolId\":\"xmr1\""));
        assert!(text.contains("\"isBlockCandidate\":false"));
        let decoded = decode_share(&payload, WireFormat::Json).unwrap();
        assert_eq!(decoded, sample_share());
    }

    #[test]
    fn flags_select_format() {
        assert_eq!(parse_flags(&2u32.to_be_bytes()).unwrap().1, WireFormat::Binary);
        assert_eq!(parse_flags(&1u32.to_be_bytes()).unwrap().1, WireFormat::Json);
    }

    #[test]
    fn reversed_flags_word_is_tolerated() {
        // A legacy publisher writing little-endian: 2u32 arrives as
        // [02, 00, 00, 00], which masks to zero big-endian.
        let (flags, format) = parse_flags(&2u32.to_le_bytes()).unwrap();
        assert_eq!(format, WireFormat::Binary);
        assert_eq!(flags & WIRE_FORMAT_MASK, 2);
    }

    #[test]
    fn garbage_flags_are_rejected() {
        assert!(matches!(parse_flags(&[0, 0, 0, 0]), Err(WireError::UnknownFormat(_))));
        assert!(matches!(parse_flags(&[1, 2]), Err(WireError::BadFlagsFrame(2))));
    }
}
