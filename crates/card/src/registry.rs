//! ATR to driver registry
//!
//! The driver set is closed and explicit: each supported card operating
//! system appears here with the exact ATRs it is known to answer with. The
//! ATR is used purely as a lookup key; no mask matching, no heuristics.

use crate::driver::{acos::AcosDriver, starcos::StarcosDriver, ProtocolDriver};

/// The closed set of supported card operating systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// STARCOS 3.x cards (G3 generation and later)
    Starcos,
    /// ACOS cards (earlier generation)
    Acos,
}

/// One registry row: ATR, the driver it selects, and the cache default
#[derive(Debug, Clone, Copy)]
pub struct RegistryEntry {
    /// Exact answer-to-reset this entry matches
    pub atr: &'static [u8],
    /// Driver variant to instantiate
    pub kind: DriverKind,
    /// Whether file caching defaults to on for this card OS
    pub default_cache_enabled: bool,
}

/// Static driver registry
pub static DRIVER_REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        atr: &[
            0x3B, 0xDF, 0x18, 0x00, 0x81, 0x31, 0xFE, 0x58, 0x80, 0x31, 0x90, 0x52, 0x41, 0x01,
            0x64, 0x05, 0xC9, 0x03, 0xAC, 0x73, 0xB7, 0xB1, 0xD4, 0x44,
        ],
        kind: DriverKind::Starcos,
        default_cache_enabled: true,
    },
    RegistryEntry {
        atr: &[
            0x3B, 0xDF, 0x96, 0x00, 0x81, 0x31, 0xFE, 0x58, 0x80, 0x31, 0x90, 0x52, 0x41, 0x01,
            0x64, 0x05, 0xC9, 0x03, 0xAC, 0x73, 0xB7, 0xB1, 0xD4, 0x22,
        ],
        kind: DriverKind::Starcos,
        default_cache_enabled: true,
    },
    RegistryEntry {
        atr: &[
            0x3B, 0xBF, 0x11, 0x00, 0x81, 0x31, 0xFE, 0x45, 0x45, 0x50, 0x41, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF1,
        ],
        kind: DriverKind::Acos,
        default_cache_enabled: false,
    },
];

/// Exact-match lookup of an ATR in the registry
pub fn lookup(atr: &[u8]) -> Option<&'static RegistryEntry> {
    DRIVER_REGISTRY.iter().find(|entry| entry.atr == atr)
}

/// Instantiate the driver for a registry entry
pub fn make_driver(kind: DriverKind) -> Box<dyn ProtocolDriver> {
    match kind {
        DriverKind::Starcos => Box::new(StarcosDriver::new()),
        DriverKind::Acos => Box::new(AcosDriver::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_is_exact() {
        let starcos = DRIVER_REGISTRY[0].atr;
        assert_eq!(lookup(starcos).unwrap().kind, DriverKind::Starcos);

        // One byte off must not match
        let mut close = starcos.to_vec();
        close[5] ^= 0x01;
        assert!(lookup(&close).is_none());

        // A truncated ATR must not match either
        assert!(lookup(&starcos[..starcos.len() - 1]).is_none());
    }

    #[test]
    fn cache_defaults_differ_per_entry() {
        assert!(DRIVER_REGISTRY.iter().any(|e| e.default_cache_enabled));
        assert!(DRIVER_REGISTRY.iter().any(|e| !e.default_cache_enabled));
    }
}
