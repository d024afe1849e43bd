//! Driver for ACOS cards (earlier generation)

use citizencard_apdu_core::Command;

use crate::registry::DriverKind;
use crate::types::{CardFile, DigestAlgorithm, PaddingScheme, PinDescriptor, PinKind};

use super::ProtocolDriver;

const AID: &[u8] = &[0xA0, 0x00, 0x00, 0x01, 0x18, 0x45, 0x4E];

const DIGEST_INFO_SHA1: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];
const DIGEST_INFO_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

const PINS: &[PinDescriptor] = &[
    PinDescriptor {
        kind: PinKind::Authentication,
        label: "Card PIN",
        min_length: 4,
        max_length: 8,
        reference: 0x01,
        key_reference: 0x01,
        pad_char: 0xFF,
        icon: "pin-card",
    },
    PinDescriptor {
        kind: PinKind::Signature,
        label: "Signature PIN",
        min_length: 6,
        max_length: 8,
        reference: 0x81,
        key_reference: 0x02,
        pad_char: 0xFF,
        icon: "pin-signature",
    },
    PinDescriptor {
        kind: PinKind::Address,
        label: "Infobox PIN",
        min_length: 4,
        max_length: 8,
        reference: 0x02,
        key_reference: 0x03,
        pad_char: 0xFF,
        icon: "pin-address",
    },
];

const FILES: &[CardFile] = &[
    CardFile {
        id: "0101",
        cacheable: true,
        window: None,
        diff_window: Some((0, 8)),
        updateable: false,
        pin: None,
        max_size: Some(1200),
    },
    CardFile {
        id: "0102",
        cacheable: false,
        window: None,
        diff_window: None,
        updateable: true,
        pin: Some(PinKind::Address),
        max_size: Some(1200),
    },
    CardFile {
        id: "0401",
        cacheable: true,
        window: None,
        diff_window: Some((0, 16)),
        updateable: false,
        pin: None,
        max_size: Some(2000),
    },
    CardFile {
        id: "0402",
        cacheable: true,
        window: None,
        diff_window: Some((0, 16)),
        updateable: false,
        pin: None,
        max_size: Some(2000),
    },
];

/// Driver for the ACOS card OS
#[derive(Debug, Default)]
pub struct AcosDriver;

impl AcosDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolDriver for AcosDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Acos
    }

    fn application_id(&self) -> &'static [u8] {
        AID
    }

    fn pin_descriptors(&self) -> &[PinDescriptor] {
        PINS
    }

    fn files(&self) -> &[CardFile] {
        FILES
    }

    fn verify_to_modify(&self) -> bool {
        false
    }

    fn digest_prefix(&self, digest: DigestAlgorithm) -> Option<&'static [u8]> {
        match digest {
            DigestAlgorithm::Sha1 => Some(DIGEST_INFO_SHA1),
            DigestAlgorithm::Sha256 => Some(DIGEST_INFO_SHA256),
        }
    }

    fn signature_algorithm_id(
        &self,
        digest: DigestAlgorithm,
        padding: PaddingScheme,
    ) -> Option<u8> {
        // One id per padding scheme, digest-independent; PSS never shipped
        // on this OS.
        match (padding, digest) {
            (PaddingScheme::Pkcs1V15, _) => Some(0x02),
            (PaddingScheme::Pss, _) => None,
        }
    }

    fn select_apdu(&self, fid: &[u8]) -> Command {
        // Select by file id from the MF, FCI in the default template
        Command::new(0x00, 0xA4, 0x00, 0x00)
            .with_data(fid.to_vec())
            .with_le(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_cover_all_pins() {
        let driver = AcosDriver::new();
        for kind in [PinKind::Authentication, PinKind::Signature, PinKind::Address] {
            assert!(driver.pin(kind).is_ok());
        }
        assert!(!driver.verify_to_modify());
    }

    #[test]
    fn select_apdu_targets_mf_child() {
        let cmd = AcosDriver::new().select_apdu(&[0x01, 0x01]);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            &[0x00, 0xA4, 0x00, 0x00, 0x02, 0x01, 0x01, 0x00]
        );
    }
}
