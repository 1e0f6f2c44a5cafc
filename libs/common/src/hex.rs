//! Hex helpers for the gateway tunnel
//!
//! Requests travel as uppercase hex ASCII, replies come back as hex text that
//! must be checked before decoding.

/// Minimum accepted length (in hex characters) of a reply payload
pub const MIN_REPLY_HEX_LEN: usize = 6;

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    ::hex::encode_upper(data)
}

/// Why a hex payload was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexRejection {
    /// Fewer than [`MIN_REPLY_HEX_LEN`] characters
    TooShort(usize),
    /// Odd number of characters
    OddLength(usize),
    /// Character outside `[0-9A-Fa-f]` at the given position
    InvalidChar(usize),
}

impl std::fmt::Display for HexRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexRejection::TooShort(len) => write!(f, "too short ({} chars)", len),
            HexRejection::OddLength(len) => write!(f, "odd length ({} chars)", len),
            HexRejection::InvalidChar(pos) => write!(f, "non-hex char at {}", pos),
        }
    }
}

/// Validate a reply payload: even length, at least 6 chars, hex alphabet only
///
/// Surrounding whitespace is ignored.
pub fn validate_reply(text: &str) -> Result<&str, HexRejection> {
    let text = text.trim();
    if text.len() < MIN_REPLY_HEX_LEN {
        return Err(HexRejection::TooShort(text.len()));
    }
    if text.len() % 2 != 0 {
        return Err(HexRejection::OddLength(text.len()));
    }
    if let Some(pos) = text.bytes().position(|b| !b.is_ascii_hexdigit()) {
        return Err(HexRejection::InvalidChar(pos));
    }
    Ok(text)
}

/// Decode a hex string (either case) into bytes
pub fn decode(text: &str) -> Result<Vec<u8>, HexRejection> {
    ::hex::decode(text).map_err(|e| match e {
        ::hex::FromHexError::InvalidHexCharacter { index, .. } => HexRejection::InvalidChar(index),
        _ => HexRejection::OddLength(text.len()),
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x12, 0x34, 0xAB]), "1234AB");
        assert_eq!(encode_upper(&[]), "");
        assert_eq!(encode_upper(&[0x0F]), "0F");
    }

    #[test]
    fn test_decode_mixed_case() {
        assert_eq!(decode("4348abCD").unwrap(), vec![0x43, 0x48, 0xAB, 0xCD]);
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(decode("ABC"), Err(HexRejection::OddLength(3)));
        assert_eq!(decode("AZ00"), Err(HexRejection::InvalidChar(1)));
    }

    #[test]
    fn test_validate_reply_accepts_well_formed() {
        assert_eq!(validate_reply("434800"), Ok("434800"));
        assert_eq!(validate_reply(" 43480000\r\n"), Ok("43480000"));
    }

    #[test]
    fn test_validate_reply_rejections() {
        assert_eq!(validate_reply("4348"), Err(HexRejection::TooShort(4)));
        assert_eq!(validate_reply("4348000"), Err(HexRejection::OddLength(7)));
        assert_eq!(validate_reply("43480G"), Err(HexRejection::InvalidChar(5)));
        assert_eq!(validate_reply("online"), Err(HexRejection::InvalidChar(0)));
    }
}
