//! Card discovery and binding
//!
//! The dispatcher walks the attached readers, keys each present card's ATR
//! against the driver registry and binds the chosen card to its driver. The
//! error taxonomy is ordered: no readers at all, readers but no card, cards
//! but none supported, a supported card but the user dismissed the selection
//! dialog. A [`BoundCard`] then carries the live transport, the driver and
//! the optional encrypted file cache through the operations.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use citizencard_apdu_core::{CardTransport, ReaderConnector};
use tracing::{debug, info};

use crate::cache::EncryptedFileCache;
use crate::config::EngineConfig;
use crate::driver::{self, ExclusiveChannel, ProtocolDriver, SignRequest};
use crate::error::{Error, Result};
use crate::pin_flow::PinFlowController;
use crate::registry::{self, DriverKind};
use crate::types::{CacheOverride, FlowSession, PinFlowResult, PinKind};

/// One supported card found during discovery
#[derive(Debug, Clone)]
pub struct CandidateCard {
    /// OS-level display name of the reader holding the card
    pub reader_name: String,
    /// Which driver the registry selected for it
    pub kind: DriverKind,
    /// The card's answer-to-reset
    pub atr: Vec<u8>,
}

/// The multi-card selection collaborator
///
/// Consulted only when discovery finds more than one supported card. Returns
/// the index of the chosen candidate, or `None` when the user dismissed the
/// dialog. `started_at` is when the surrounding operation began, so the
/// dialog can account for time already spent against its own deadline.
pub trait CardSelector: Send + Sync {
    /// Pick one of the candidates
    fn select_card(
        &self,
        candidates: &[CandidateCard],
        started_at: Instant,
        locale: &str,
    ) -> Option<usize>;
}

/// Discovers cards and binds them to their drivers
pub struct CardDispatcher<C: ReaderConnector> {
    connector: C,
    config: EngineConfig,
    selector: Arc<dyn CardSelector>,
}

impl<C: ReaderConnector> fmt::Debug for CardDispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: ReaderConnector> CardDispatcher<C> {
    /// Create a dispatcher over a reader backend
    pub fn new(connector: C, config: EngineConfig, selector: Arc<dyn CardSelector>) -> Self {
        Self {
            connector,
            config,
            selector,
        }
    }

    /// Find a supported card and bind it to its driver
    ///
    /// With several supported cards present the selection collaborator
    /// decides; with exactly one it is never consulted.
    pub fn discover(
        &self,
        locale: &str,
        cache_override: CacheOverride,
    ) -> Result<BoundCard<C::Transport>> {
        assert_engine_thread();
        let started_at = Instant::now();

        let readers = self.connector.list_readers()?;
        if readers.is_empty() {
            return Err(Error::ReaderNotFound);
        }

        let carded: Vec<_> = readers.iter().filter(|r| r.has_card()).collect();
        if carded.is_empty() {
            return Err(Error::CardNotPresent);
        }

        let mut candidates = Vec::new();
        let mut entries = Vec::new();
        let mut unknown_seen = false;
        for reader in carded {
            // A reader that could not even report an ATR is treated like a
            // transient fault on that reader, not a scan abort
            let Some(atr) = reader.atr() else { continue };
            if let Some(entry) = registry::lookup(atr) {
                candidates.push(CandidateCard {
                    reader_name: reader.name().to_string(),
                    kind: entry.kind,
                    atr: atr.to_vec(),
                });
                entries.push(entry);
            } else {
                debug!(reader = reader.name(), atr = %hex::encode(atr), "unsupported card");
                unknown_seen = true;
            }
        }
        if candidates.is_empty() {
            return Err(if unknown_seen {
                Error::UnknownCard
            } else {
                Error::CardNotPresent
            });
        }

        let index = if candidates.len() == 1 {
            0
        } else {
            self.selector
                .select_card(&candidates, started_at, locale)
                .ok_or(Error::SelectionCancelled)?
        };
        let candidate = candidates
            .get(index)
            .ok_or(Error::InvalidData("selection index out of range"))?;
        let entry = entries[index];

        let transport = self.connector.connect(&candidate.reader_name)?;
        let cache_enabled = match cache_override {
            CacheOverride::Default => entry.default_cache_enabled,
            CacheOverride::On => true,
            CacheOverride::Off => false,
        };
        info!(
            reader = %candidate.reader_name,
            kind = ?entry.kind,
            cache_enabled,
            "bound card"
        );
        Ok(BoundCard {
            transport,
            driver: registry::make_driver(entry.kind),
            kind: entry.kind,
            cache_enabled,
            cache: None,
        })
    }
}

/// A discovered card bound to its driver over a live transport
pub struct BoundCard<T: CardTransport> {
    transport: T,
    driver: Box<dyn ProtocolDriver>,
    kind: DriverKind,
    cache_enabled: bool,
    cache: Option<EncryptedFileCache>,
}

impl<T: CardTransport> fmt::Debug for BoundCard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCard")
            .field("kind", &self.kind)
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl<T: CardTransport> BoundCard<T> {
    /// Which card operating system this card runs
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    /// The driver bound to this card
    pub fn driver(&self) -> &dyn ProtocolDriver {
        self.driver.as_ref()
    }

    /// The reader this card sits in
    pub fn reader_name(&self) -> &str {
        self.transport.reader_name()
    }

    /// Whether the file cache participates in reads
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Attach an encrypted file cache
    ///
    /// Whether it actually participates still depends on the per-card cache
    /// decision made at discovery and on each file's cacheability.
    pub fn attach_cache(&mut self, cache: EncryptedFileCache) {
        self.cache = Some(cache);
    }

    /// Read a file, serving cacheable content from the cache when its
    /// revalidation fragment still matches the card
    ///
    /// The whole sequence, revalidation fragment included, runs under
    /// exclusive channel use.
    pub fn read_file(&mut self, id: &str) -> Result<Vec<u8>> {
        assert_engine_thread();
        let file = self
            .driver
            .file(id)
            .ok_or(Error::InvalidData("driver does not expose this file"))?
            .clone();
        let mut guard = ExclusiveChannel::acquire(&mut self.transport)?;

        if self.cache_enabled && file.cacheable {
            if let Some(cache) = &self.cache {
                if let Some((offset, length)) = file.diff_window {
                    let fragment =
                        self.driver
                            .read_fragment(guard.transport(), &file, offset, length)?;
                    if let Some(content) = cache.read_if_matches(id, (offset, length), &fragment) {
                        debug!(file = id, "cache fragment matches, serving cached content");
                        return Ok(content);
                    }
                } else if let Some(content) = cache.read(id) {
                    debug!(file = id, "serving cached content");
                    return Ok(content);
                }
            }
        }

        let content = self.driver.read_file(guard.transport(), &file)?;
        if self.cache_enabled && file.cacheable {
            if let Some(cache) = &self.cache {
                cache.write(id, &content);
                cache.enforce_threshold();
            }
        }
        Ok(content)
    }

    /// Produce a digital signature over a precomputed hash
    pub fn sign(
        &mut self,
        flow: &PinFlowController,
        request: &SignRequest,
        session: &FlowSession,
    ) -> Result<Vec<u8>> {
        assert_engine_thread();
        driver::sign(
            self.driver.as_ref(),
            &mut self.transport,
            flow,
            request,
            session,
        )
    }

    /// Verify a PIN outside of a signature flow
    pub fn verify_pin(
        &mut self,
        flow: &PinFlowController,
        kind: PinKind,
        session: &FlowSession,
    ) -> Result<PinFlowResult> {
        assert_engine_thread();
        let descriptor = self.driver.pin(kind)?.clone();
        let mut guard = ExclusiveChannel::acquire(&mut self.transport)?;
        self.driver.select_application(guard.transport())?;
        flow.verify_pin(
            guard.transport(),
            self.driver.as_ref(),
            &descriptor,
            None,
            session,
        )
    }

    /// Change a PIN
    ///
    /// Application selection happens inside the flow, under its exclusive
    /// channel guard.
    pub fn modify_pin(
        &mut self,
        flow: &PinFlowController,
        kind: PinKind,
        session: &FlowSession,
    ) -> Result<PinFlowResult> {
        assert_engine_thread();
        let descriptor = self.driver.pin(kind)?.clone();
        flow.modify_pin(&mut self.transport, self.driver.as_ref(), &descriptor, session)
    }

    /// Ask the card for 8 random bytes
    pub fn get_challenge(&mut self) -> Result<[u8; 8]> {
        assert_engine_thread();
        self.driver.get_challenge(&mut self.transport)
    }

    /// Produce `n` card-generated random bytes
    pub fn random_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        assert_engine_thread();
        self.driver.random_bytes(&mut self.transport, n)
    }
}

/// Card I/O must never run on the PIN interaction thread: the flow blocks
/// the engine thread on that thread's result, so card work issued from it
/// deadlocks.
fn assert_engine_thread() {
    assert!(
        thread::current().name() != Some("pin-entry"),
        "card operation issued from the PIN interaction thread"
    );
}
