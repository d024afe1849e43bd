//! CCID "direct PIN" frame encoding
//!
//! PIN-pad readers take a fixed byte structure describing how to collect the
//! PIN and where to insert the digits into the enclosed APDU. Field values
//! and their exact order are reader-protocol-defined and must be bit-exact;
//! the conformance tests below pin the byte layout. Any field reordering
//! breaks hardware interoperability - these frames are not versioned.

use bytes::{BufMut, BytesMut};
use citizencard_apdu_core::Command;

/// Frame dialect spoken by a reader vendor
///
/// Different vendors want different control-byte values for the same
/// semantic operation. The profile is selected per normalized reader name
/// through [`ReaderPolicy`](crate::ReaderPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadProfile {
    /// Standard CCID field values
    #[default]
    Ccid,
    /// Older Gemalto firmware: BCD format string, key-press validation
    GemaltoLegacy,
}

impl PadProfile {
    const fn format_string(self) -> u8 {
        match self {
            Self::Ccid => 0x02,
            Self::GemaltoLegacy => 0x82,
        }
    }

    const fn validation_condition(self) -> u8 {
        match self {
            Self::Ccid => 0x02,
            Self::GemaltoLegacy => 0x07,
        }
    }
}

/// Deterministic packer for verify/modify direct-PIN frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder {
    profile: PadProfile,
}

impl FrameEncoder {
    /// Create an encoder for a frame dialect
    pub const fn new(profile: PadProfile) -> Self {
        Self { profile }
    }

    /// Encode a PIN_VERIFY structure around the given VERIFY APDU
    pub fn encode_verify(&self, timeout: u8, min_len: u8, max_len: u8, apdu: &Command) -> Vec<u8> {
        let apdu_bytes = apdu.to_bytes();
        let mut frame = BytesMut::with_capacity(17 + apdu_bytes.len());

        frame.put_u8(timeout); // bTimeOut
        frame.put_u8(timeout); // bTimeOut2, after first key stroke
        frame.put_u8(self.profile.format_string()); // bmFormatString
        frame.put_u8(0x08); // bmPINBlockString: 8-byte block
        frame.put_u8(0x00); // bmPINLengthFormat
        frame.put_u8(max_len); // wPINMaxExtraDigit, max
        frame.put_u8(min_len); // wPINMaxExtraDigit, min
        frame.put_u8(self.profile.validation_condition()); // bEntryValidationCondition
        frame.put_u8(0x01); // bNumberMessage
        frame.put_u8(0x09); // wLangId: en-US
        frame.put_u8(0x04);
        frame.put_u8(0x00); // bMsgIndex
        frame.put_slice(&[0x00, 0x00, 0x00]); // bTeoPrologue
        frame.put_u8(apdu_bytes.len() as u8); // data length
        frame.put_slice(&apdu_bytes);

        frame.to_vec()
    }

    /// Encode a PIN_MODIFY structure around the given change APDU
    ///
    /// When verification precedes the modification as a separate step, the
    /// frame carries a single (new) PIN block: both insertion offsets stay
    /// zero, the pad asks for the new PIN plus confirmation. Otherwise the
    /// frame carries old and new blocks; the new-PIN insertion offset points
    /// past the old block and the pad runs the full three-prompt sequence.
    pub fn encode_modify(
        &self,
        verify_precedes_modify: bool,
        timeout: u8,
        min_len: u8,
        max_len: u8,
        apdu: &Command,
    ) -> Vec<u8> {
        let apdu_bytes = apdu.to_bytes();
        let mut frame = BytesMut::with_capacity(24 + apdu_bytes.len());

        let (offset_new, confirm, messages) = if verify_precedes_modify {
            (0x00, 0x01, 0x02)
        } else {
            (0x08, 0x03, 0x03)
        };

        frame.put_u8(timeout); // bTimeOut
        frame.put_u8(timeout); // bTimeOut2
        frame.put_u8(self.profile.format_string()); // bmFormatString
        frame.put_u8(0x08); // bmPINBlockString
        frame.put_u8(0x00); // bmPINLengthFormat
        frame.put_u8(0x00); // bInsertionOffsetOld
        frame.put_u8(offset_new); // bInsertionOffsetNew
        frame.put_u8(max_len); // wPINMaxExtraDigit, max
        frame.put_u8(min_len); // wPINMaxExtraDigit, min
        frame.put_u8(confirm); // bConfirmPIN
        frame.put_u8(self.profile.validation_condition()); // bEntryValidationCondition
        frame.put_u8(messages); // bNumberMessage
        frame.put_u8(0x09); // wLangId: en-US
        frame.put_u8(0x04);
        frame.put_u8(0x00); // bMsgIndex1
        frame.put_u8(0x01); // bMsgIndex2
        frame.put_u8(0x02); // bMsgIndex3
        frame.put_slice(&[0x00, 0x00, 0x00]); // bTeoPrologue
        frame.put_u8(apdu_bytes.len() as u8); // data length
        frame.put_slice(&apdu_bytes);

        frame.to_vec()
    }
}
