//! Driver for STARCOS 3.x cards (G3 generation and later)

use citizencard_apdu_core::Command;

use crate::registry::DriverKind;
use crate::types::{CardFile, DigestAlgorithm, PaddingScheme, PinDescriptor, PinKind};

use super::ProtocolDriver;

const AID: &[u8] = &[0xD0, 0x40, 0x00, 0x00, 0x17, 0x00, 0x12, 0x01];

const DIGEST_INFO_SHA1: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];
const DIGEST_INFO_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// The G3 card OS ORs this bit into the algorithm id when the hash is
/// SHA-256. The older OS never does; see the table test in `driver::tests`.
const SHA256_ALGO_FIXUP: u8 = 0x10;

const PINS: &[PinDescriptor] = &[
    PinDescriptor {
        kind: PinKind::Authentication,
        label: "Card PIN",
        min_length: 4,
        max_length: 8,
        reference: 0x01,
        key_reference: 0x02,
        pad_char: 0x00,
        icon: "pin-card",
    },
    PinDescriptor {
        kind: PinKind::Signature,
        label: "Signature PIN",
        min_length: 6,
        max_length: 8,
        reference: 0x81,
        key_reference: 0x04,
        pad_char: 0x00,
        icon: "pin-signature",
    },
    PinDescriptor {
        kind: PinKind::Address,
        label: "Address PIN",
        min_length: 4,
        max_length: 8,
        reference: 0x02,
        key_reference: 0x06,
        pad_char: 0x00,
        icon: "pin-address",
    },
];

const FILES: &[CardFile] = &[
    CardFile {
        id: "D001",
        cacheable: true,
        window: None,
        // The first 8 bytes carry the infobox header including its version
        // counter; enough to notice a rewritten box.
        diff_window: Some((0, 8)),
        updateable: false,
        pin: None,
        max_size: Some(1500),
    },
    CardFile {
        id: "D002",
        cacheable: false,
        window: None,
        diff_window: None,
        updateable: true,
        pin: Some(PinKind::Address),
        max_size: Some(1500),
    },
    CardFile {
        id: "C000",
        cacheable: true,
        window: None,
        diff_window: Some((0, 16)),
        updateable: false,
        pin: None,
        max_size: Some(2000),
    },
    CardFile {
        id: "C002",
        cacheable: true,
        window: None,
        diff_window: Some((0, 16)),
        updateable: false,
        pin: None,
        max_size: Some(2000),
    },
];

/// Driver for the STARCOS card OS
#[derive(Debug, Default)]
pub struct StarcosDriver;

impl StarcosDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolDriver for StarcosDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Starcos
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
        true
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
        let base = match padding {
            PaddingScheme::Pkcs1V15 => 0x02,
            PaddingScheme::Pss => 0x05,
        };
        match digest {
            DigestAlgorithm::Sha1 => Some(base),
            DigestAlgorithm::Sha256 => Some(base | SHA256_ALGO_FIXUP),
        }
    }

    fn select_apdu(&self, fid: &[u8]) -> Command {
        // Select EF under the current DF, FCI requested
        Command::new(0x00, 0xA4, 0x02, 0x04)
            .with_data(fid.to_vec())
            .with_le(0)
    }
}
