//! Value types shared across the engine

use std::fmt;

use zeroize::Zeroize;

/// The logical PINs a card driver can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinKind {
    /// Card holder authentication PIN
    Authentication,
    /// Qualified signature PIN
    Signature,
    /// Address / infobox PIN
    Address,
}

/// Immutable description of one logical PIN, created by a driver at
/// construction
#[derive(Debug, Clone)]
pub struct PinDescriptor {
    /// Which logical PIN this describes
    pub kind: PinKind,
    /// Display label, e.g. shown by the collection dialog
    pub label: &'static str,
    /// Minimum number of PIN digits
    pub min_length: u8,
    /// Maximum number of PIN digits
    pub max_length: u8,
    /// PIN reference byte (P2 of VERIFY)
    pub reference: u8,
    /// Key reference used when setting the security environment for this PIN
    pub key_reference: u8,
    /// Byte used to pad the PIN block
    pub pad_char: u8,
    /// Asset name for the dialog icon
    pub icon: &'static str,
}

/// Immutable description of one on-card file, created by a driver at
/// construction
#[derive(Debug, Clone)]
pub struct CardFile {
    /// File identifier (hex-encoded two-byte FID)
    pub id: &'static str,
    /// Whether the encrypted cache may hold this file's content
    pub cacheable: bool,
    /// Optional `(offset, length)` window for partial reads
    pub window: Option<(u32, usize)>,
    /// Optional `(offset, length)` window compared against a freshly read
    /// fragment to detect that the on-card file changed. Purely a
    /// caller-supplied slice for equality comparison; never interpreted.
    pub diff_window: Option<(usize, usize)>,
    /// Whether the file can be written
    pub updateable: bool,
    /// PIN protecting writes, if any
    pub pin: Option<PinKind>,
    /// Upper bound on the file size, used when the FCI declares none
    pub max_size: Option<usize>,
}

/// PIN bytes, zeroized on drop
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretPin(Vec<u8>);

impl SecretPin {
    /// Wrap PIN bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw PIN digits
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of PIN digits
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the PIN is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretPin(len={})", self.0.len())
    }
}

impl From<&str> for SecretPin {
    fn from(pin: &str) -> Self {
        Self(pin.as_bytes().to_vec())
    }
}

/// Outcome of one PIN verification or modification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFlowResult {
    /// The card accepted the PIN
    Success,
    /// The card rejected the PIN; this many tries remain
    WrongPin(u8),
    /// The PIN has no tries remaining
    Blocked,
    /// The user declined to enter a PIN
    Cancelled,
    /// The entry timer fired with nothing entered
    TimedOut,
}

/// Per-flow session context, set before a flow begins and dropped with it
///
/// Replaces ambient state: the info message shown by collection dialogs and
/// the OTP-driven PIN-change marker travel with the call.
#[derive(Debug, Clone, Default)]
pub struct FlowSession {
    /// BCP 47 language tag for collaborator dialogs
    pub locale: String,
    /// Informational message for the collection dialog, if any
    pub info_message: Option<String>,
    /// Whether an OTP-driven PIN change is in progress; forces external PIN
    /// pass-through during the change sequence
    pub pin_change_in_progress: bool,
}

impl FlowSession {
    /// Create a session for the given locale
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            ..Self::default()
        }
    }

    /// Set the dialog info message
    pub fn with_info_message(mut self, message: impl Into<String>) -> Self {
        self.info_message = Some(message.into());
        self
    }
}

/// Caller's say over per-card cache defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheOverride {
    /// Let the driver's registry entry decide
    #[default]
    Default,
    /// Force caching on
    On,
    /// Force caching off
    Off,
}

/// Digest algorithms the drivers know how to wrap into a DigestInfo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

/// Signature padding schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaddingScheme {
    /// RSASSA PKCS#1 v1.5
    Pkcs1V15,
    /// RSASSA-PSS
    Pss,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_pin_debug_hides_digits() {
        let pin = SecretPin::from("1234");
        assert_eq!(format!("{pin:?}"), "SecretPin(len=4)");
        assert_eq!(pin.as_bytes(), b"1234");
    }
}
