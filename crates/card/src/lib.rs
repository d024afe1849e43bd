//! Client-side engine for government eID smart cards
//!
//! This crate drives a government-issued identity smart card through a
//! generic reader interface: it discovers a connected card, identifies which
//! of several incompatible on-card operating systems it runs, speaks that
//! OS's APDU dialect to select files, read data, set up a security
//! environment and produce digital signatures, and manages the PIN-entry
//! flow, including the divergent path for readers with a physical PIN pad.
//! An encrypted on-disk cache avoids re-reading immutable card files.
//!
//! The reader transport itself (PC/SC or otherwise) is a collaborator: it
//! implements the [`CardTransport`] and [`ReaderConnector`] traits from
//! `citizencard-apdu-core`. PIN collection and multi-card selection dialogs
//! are likewise collaborators behind the [`PinCollector`] and
//! [`CardSelector`] traits.
//!
//! Typical use:
//!
//! ```ignore
//! let dispatcher = CardDispatcher::new(connector, config.clone(), selector);
//! let mut card = dispatcher.discover("de-AT", CacheOverride::Default)?;
//! card.attach_cache(EncryptedFileCache::new(cache_dir, &instance_prefix, &secret, &config));
//! let flow = PinFlowController::new(config, collector);
//! let signature = card.sign(&flow, &request, &session)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod pin_flow;
pub mod pinpad;
pub mod registry;
pub mod types;
pub(crate) mod util;

pub use cache::EncryptedFileCache;
pub use config::{EngineConfig, ReaderPolicy};
pub use dispatch::{BoundCard, CandidateCard, CardDispatcher, CardSelector};
pub use driver::{ProtocolDriver, SignRequest};
pub use error::{Error, Result};
pub use pin_flow::{Collected, CollectedChange, PinCollector, PinFlowController};
pub use pinpad::features::FeatureSet;
pub use pinpad::frame::{FrameEncoder, PadProfile};
pub use registry::DriverKind;
pub use types::{
    CacheOverride, CardFile, DigestAlgorithm, FlowSession, PaddingScheme, PinDescriptor, PinKind,
    PinFlowResult, SecretPin,
};

pub use citizencard_apdu_core::{CardTransport, ReaderConnector};
