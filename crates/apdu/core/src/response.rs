//! APDU response parsing and status word interpretation

use std::fmt;

use bytes::Bytes;

use crate::transport::TransportError;

/// A 2-byte status word returned with every APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte
    pub sw1: u8,
    /// Second status byte
    pub sw2: u8,
}

impl StatusWord {
    /// Create a status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// The status word as a single big-endian u16
    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    /// Whether this is the normal-completion status word (`9000`)
    pub const fn is_success(self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }
}

impl From<u16> for StatusWord {
    fn from(word: u16) -> Self {
        Self::new((word >> 8) as u8, (word & 0xFF) as u8)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Common status words
pub mod status {
    use super::StatusWord;

    /// Normal completion
    pub const SW_NO_ERROR: StatusWord = StatusWord::new(0x90, 0x00);
    /// Authentication method blocked
    pub const SW_AUTH_METHOD_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);
    /// File or application not found
    pub const SW_FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
    /// Verification failed, no tries remaining
    pub const SW_COUNTER_EXHAUSTED: StatusWord = StatusWord::new(0x63, 0xC0);

    /// Verification failed; `sw2 & 0x0F` tries remain when `sw1 == 0x63` and
    /// `sw2 & 0xF0 == 0xC0`
    pub const fn retry_counter(sw: StatusWord) -> Option<u8> {
        if sw.sw1 == 0x63 && sw.sw2 & 0xF0 == 0xC0 {
            Some(sw.sw2 & 0x0F)
        } else {
            None
        }
    }
}

/// A parsed APDU response: optional payload plus status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Option<Bytes>,
    status: StatusWord,
}

impl Response {
    /// Create a response from its parts
    pub const fn new(payload: Option<Bytes>, status: StatusWord) -> Self {
        Self { payload, status }
    }

    /// Create a success response with an optional payload
    pub const fn success(payload: Option<Bytes>) -> Self {
        Self::new(payload, status::SW_NO_ERROR)
    }

    /// Parse a raw response: the trailing two bytes are the status word,
    /// anything before them is the payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 2 {
            return Err(TransportError::InvalidResponseLength(bytes.len()));
        }
        let (payload, sw) = bytes.split_at(bytes.len() - 2);
        let payload = if payload.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(payload))
        };
        Ok(Self::new(payload, StatusWord::new(sw[0], sw[1])))
    }

    /// The response payload, if any
    pub const fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// The status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Whether the status word is `9000`
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_roundtrip() {
        let sw = StatusWord::new(0x6A, 0x82);
        assert_eq!(sw.to_u16(), 0x6A82);
        assert_eq!(StatusWord::from(0x6A82u16), sw);
        assert_eq!(format!("{sw}"), "6A82");
    }

    #[test]
    fn test_retry_counter() {
        assert_eq!(status::retry_counter(StatusWord::new(0x63, 0xC2)), Some(2));
        assert_eq!(status::retry_counter(status::SW_COUNTER_EXHAUSTED), Some(0));
        assert_eq!(status::retry_counter(StatusWord::new(0x63, 0x85)), None);
        assert_eq!(status::retry_counter(status::SW_NO_ERROR), None);
    }

    #[test]
    fn test_response_parsing() {
        let resp = Response::from_bytes(&[0x90, 0x00]).unwrap();
        assert!(resp.is_success());
        assert!(resp.payload().is_none());

        let resp = Response::from_bytes(&[0xDE, 0xAD, 0x63, 0xC1]).unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.payload().unwrap().as_ref(), &[0xDE, 0xAD]);
        assert_eq!(resp.status(), StatusWord::new(0x63, 0xC1));

        assert!(Response::from_bytes(&[0x90]).is_err());
    }
}
