//! Configuration options for the engine
//!
//! All knobs live in one plain struct with builder-style setters. Policy
//! overrides for individual readers are keyed by the normalized reader name
//! (instance suffixes like a trailing `" 2"` stripped), so two OS-level
//! handles of the same physical reader model resolve to one entry.

use std::collections::HashMap;
use std::time::Duration;

use crate::pinpad::frame::PadProfile;
use crate::registry::DriverKind;

/// Per-reader policy overrides
///
/// Every axis defaults to permissive when unset; only explicit configuration
/// entries restrict behavior.
#[derive(Debug, Clone, Default)]
pub struct ReaderPolicy {
    /// Whether the reader's PIN pad may be used at all
    pub pin_pad: Option<bool>,
    /// Whether the pad may be used for a specific card driver
    pub pin_pad_for: HashMap<DriverKind, bool>,
    /// Whether the host OS may inject an already collected PIN instead of
    /// delegating entry to the pad
    pub os_pin_injection: Option<bool>,
    /// Which PIN-pad frame dialect the reader speaks
    pub pad_profile: PadProfile,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long one PIN-collection attempt may run
    pub pin_timeout: Duration,
    /// Whether PIN collection is bounded by a timer at all
    pub timed_interaction: bool,
    /// How long a cache entry stays valid after it was written
    pub cache_validity: Duration,
    /// How many card-instance groups the cache keeps; `None` disables eviction
    pub eviction_threshold: Option<usize>,
    /// Whether a caller-supplied PIN may bypass interactive collection
    pub allow_external_pin_caching: bool,
    /// Per-reader policy overrides, keyed by normalized reader name
    pub reader_policies: HashMap<String, ReaderPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pin_timeout: Duration::from_secs(30),
            timed_interaction: true,
            cache_validity: Duration::from_secs(24 * 60 * 60),
            eviction_threshold: Some(8),
            allow_external_pin_caching: false,
            reader_policies: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PIN-collection timeout
    pub const fn with_pin_timeout(mut self, timeout: Duration) -> Self {
        self.pin_timeout = timeout;
        self
    }

    /// Enable or disable the PIN-collection timer
    pub const fn with_timed_interaction(mut self, enabled: bool) -> Self {
        self.timed_interaction = enabled;
        self
    }

    /// Set the cache validity horizon
    pub const fn with_cache_validity(mut self, validity: Duration) -> Self {
        self.cache_validity = validity;
        self
    }

    /// Set the eviction group threshold (`None` disables eviction)
    pub const fn with_eviction_threshold(mut self, threshold: Option<usize>) -> Self {
        self.eviction_threshold = threshold;
        self
    }

    /// Allow or forbid external PIN pass-through
    pub const fn with_external_pin_caching(mut self, allowed: bool) -> Self {
        self.allow_external_pin_caching = allowed;
        self
    }

    /// Add a policy override for a reader (name is normalized on insert)
    pub fn with_reader_policy(mut self, reader_name: &str, policy: ReaderPolicy) -> Self {
        self.reader_policies
            .insert(crate::util::normalize_reader_name(reader_name), policy);
        self
    }

    /// Look up the policy for a reader by its (unnormalized) display name
    pub fn reader_policy(&self, reader_name: &str) -> Option<&ReaderPolicy> {
        self.reader_policies
            .get(&crate::util::normalize_reader_name(reader_name))
    }
}
