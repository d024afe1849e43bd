//! Reader capability probing and PIN-pad policy
//!
//! Whether a PIN pad gets used is the conjunction of three independent
//! axes: the reader advertises the feature, policy allows the pad for this
//! reader model, and policy allows it for the active card driver. Each axis
//! is overridable per normalized reader name; absent configuration means
//! permissive.

use citizencard_apdu_core::CardTransport;
use tracing::debug;

use crate::config::EngineConfig;
use crate::registry::DriverKind;

/// Control code of the CCID GET_FEATURE_REQUEST (`SCARD_CTL_CODE(3400)`)
pub const CM_IOCTL_GET_FEATURE_REQUEST: u32 = 0x4200_0000 + 3400;

/// Feature tag: verify PIN directly on the pad
pub const FEATURE_VERIFY_PIN_DIRECT: u8 = 0x06;
/// Feature tag: modify PIN directly on the pad
pub const FEATURE_MODIFY_PIN_DIRECT: u8 = 0x07;

/// The PIN-pad features one reader advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    verify_pin_direct: Option<u32>,
    modify_pin_direct: Option<u32>,
}

impl FeatureSet {
    /// Query the reader for its feature list
    ///
    /// A failing or empty response means the reader has no pad; that is a
    /// normal answer, not an error.
    pub fn probe(transport: &mut dyn CardTransport) -> Self {
        match transport.send_control(CM_IOCTL_GET_FEATURE_REQUEST, &[]) {
            Ok(response) => {
                let features = Self::parse(&response);
                debug!(
                    reader = transport.reader_name(),
                    verify = features.verify_pin_direct.is_some(),
                    modify = features.modify_pin_direct.is_some(),
                    "probed reader features"
                );
                features
            }
            Err(err) => {
                debug!(reader = transport.reader_name(), %err, "feature probe failed, assuming no pad");
                Self::default()
            }
        }
    }

    /// Parse the flat feature list
    ///
    /// The response is a sequence of 6-byte records
    /// `[tag(1), length(1)=04, control-code(4, big-endian)]`. The scan
    /// advances strictly by 6 bytes per record; unknown tags are skipped,
    /// a trailing partial record is ignored.
    pub fn parse(response: &[u8]) -> Self {
        let mut features = Self::default();
        for record in response.chunks_exact(6) {
            let code = u32::from_be_bytes([record[2], record[3], record[4], record[5]]);
            match record[0] {
                FEATURE_VERIFY_PIN_DIRECT => features.verify_pin_direct = Some(code),
                FEATURE_MODIFY_PIN_DIRECT => features.modify_pin_direct = Some(code),
                _ => {}
            }
        }
        features
    }

    /// Whether the reader can verify a PIN on its own pad
    pub const fn has_verify_pin_pad(&self) -> bool {
        self.verify_pin_direct.is_some()
    }

    /// Whether the reader can run a PIN change on its own pad
    pub const fn has_modify_pin_pad(&self) -> bool {
        self.modify_pin_direct.is_some()
    }

    /// Control code for the verify-direct operation
    pub const fn verify_control_code(&self) -> Option<u32> {
        self.verify_pin_direct
    }

    /// Control code for the modify-direct operation
    pub const fn modify_control_code(&self) -> Option<u32> {
        self.modify_pin_direct
    }
}

/// Whether policy allows using this reader's pad at all
pub fn pad_allowed(config: &EngineConfig, reader_name: &str) -> bool {
    config
        .reader_policy(reader_name)
        .and_then(|p| p.pin_pad)
        .unwrap_or(true)
}

/// Whether policy allows the pad for this reader/card-driver pairing
pub fn supports_verify_via_pin_pad(
    config: &EngineConfig,
    reader_name: &str,
    kind: DriverKind,
) -> bool {
    config
        .reader_policy(reader_name)
        .and_then(|p| p.pin_pad_for.get(&kind).copied())
        .unwrap_or(true)
}

/// Whether policy allows the host OS to inject an already collected PIN
/// instead of delegating entry to the pad
pub fn can_inject_pin_via_os(config: &EngineConfig, reader_name: &str) -> bool {
    config
        .reader_policy(reader_name)
        .and_then(|p| p.os_pin_injection)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderPolicy;
    use citizencard_apdu_core::MockTransport;

    #[test]
    fn parse_walks_six_byte_records() {
        // Unknown tag, then verify, then modify
        let response = [
            0x01, 0x04, 0x00, 0x31, 0x30, 0x00, //
            0x06, 0x04, 0x42, 0x33, 0x00, 0x06, //
            0x07, 0x04, 0x42, 0x33, 0x00, 0x07, //
        ];
        let features = FeatureSet::parse(&response);
        assert!(features.has_verify_pin_pad());
        assert!(features.has_modify_pin_pad());
        assert_eq!(features.verify_control_code(), Some(0x4233_0006));
        assert_eq!(features.modify_control_code(), Some(0x4233_0007));
    }

    #[test]
    fn parse_ignores_trailing_partial_record() {
        let response = [0x06, 0x04, 0x42, 0x33, 0x00, 0x06, 0x07, 0x04];
        let features = FeatureSet::parse(&response);
        assert!(features.has_verify_pin_pad());
        assert!(!features.has_modify_pin_pad());
    }

    #[test]
    fn empty_probe_means_no_pad() {
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        let features = FeatureSet::probe(&mut transport);
        assert_eq!(features, FeatureSet::default());
        assert_eq!(
            transport.control_commands[0].0,
            CM_IOCTL_GET_FEATURE_REQUEST
        );
    }

    #[test]
    fn policy_axes_default_permissive_and_normalize_names() {
        let config = EngineConfig::new();
        assert!(pad_allowed(&config, "Any Reader"));
        assert!(supports_verify_via_pin_pad(&config, "Any Reader", DriverKind::Acos));
        assert!(can_inject_pin_via_os(&config, "Any Reader"));

        let mut policy = ReaderPolicy {
            pin_pad: Some(false),
            ..ReaderPolicy::default()
        };
        policy.pin_pad_for.insert(DriverKind::Starcos, false);
        let config = EngineConfig::new().with_reader_policy("Gemalto PC Twin Reader", policy);

        // The second OS-level handle of the same model hits the same entry
        assert!(!pad_allowed(&config, "Gemalto PC Twin Reader 2"));
        assert!(!supports_verify_via_pin_pad(
            &config,
            "Gemalto PC Twin Reader 2",
            DriverKind::Starcos
        ));
        // The per-driver axis is independent
        assert!(supports_verify_via_pin_pad(
            &config,
            "Gemalto PC Twin Reader 2",
            DriverKind::Acos
        ));
    }
}
