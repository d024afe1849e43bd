//! Encrypted on-disk file cache
//!
//! Card files that never change for a given card instance (identity data,
//! certificates) are expensive to read over the APDU channel, so they are
//! cached on disk under authenticated encryption. One cache entry is one
//! file:
//!
//! ```text
//! [version (u32 BE)] [IV (16)] [HMAC-SHA256 tag (32)] [ciphertext]
//! ```
//!
//! The ciphertext is AES-128-CBC over `[timestamp millis (u64 BE)]` followed
//! by the plaintext, PKCS#7-padded. The tag covers the ciphertext. The
//! 32-byte cache secret splits into the encryption key and the MAC key.
//!
//! Every read validates the whole envelope; an entry that fails any check
//! (wrong version, bad tag, damaged padding, expired timestamp) is deleted
//! and reported as absent. Entry names are `{instance}_{file_id}`, so one
//! card instance forms one group; when more groups accumulate than the
//! eviction threshold allows, the oldest groups are swept out.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::Aes128;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::config::EngineConfig;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const CACHE_FORMAT_VERSION: u32 = 1;
const SECRET_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = 4 + IV_LEN + TAG_LEN;

/// The split cache secret, zeroized on drop
#[derive(Zeroize)]
#[zeroize(drop)]
struct CacheKeys {
    enc: [u8; 16],
    mac: [u8; 16],
}

/// Authenticated encrypted cache for card file content
///
/// Construction never fails: a secret of the wrong length disables the cache
/// silently, every operation then behaves as a miss. Write failures are
/// logged and swallowed; the cache is an accelerator, never a correctness
/// dependency.
pub struct EncryptedFileCache {
    dir: PathBuf,
    prefix: String,
    keys: Option<CacheKeys>,
    validity: Duration,
    eviction_threshold: Option<usize>,
}

impl std::fmt::Debug for EncryptedFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileCache")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("enabled", &self.keys.is_some())
            .finish_non_exhaustive()
    }
}

impl EncryptedFileCache {
    /// Open a cache for one card instance
    ///
    /// `prefix` identifies the card instance and becomes the entry-name
    /// group key; `secret` must be exactly 32 bytes.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        secret: &[u8],
        config: &EngineConfig,
    ) -> Self {
        let keys = if secret.len() == SECRET_LEN {
            let mut enc = [0u8; 16];
            let mut mac = [0u8; 16];
            enc.copy_from_slice(&secret[..16]);
            mac.copy_from_slice(&secret[16..]);
            Some(CacheKeys { enc, mac })
        } else {
            warn!(len = secret.len(), "cache secret has wrong length, cache disabled");
            None
        };
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            keys,
            validity: config.cache_validity,
            eviction_threshold: config.eviction_threshold,
        }
    }

    /// Whether the cache is operational
    pub fn enabled(&self) -> bool {
        self.keys.is_some()
    }

    /// Whether an entry for this file id exists on disk
    ///
    /// Existence only; the entry may still fail validation on read.
    pub fn is_cached(&self, file_id: &str) -> bool {
        self.keys.is_some() && self.entry_path(file_id).is_file()
    }

    /// Store file content
    pub fn write(&self, file_id: &str, content: &[u8]) {
        self.write_at(file_id, content, now_millis());
    }

    /// Fetch file content, validating the whole envelope
    ///
    /// Any validation failure deletes the entry and reads as a miss.
    pub fn read(&self, file_id: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(file_id);
        let raw = fs::read(&path).ok()?;
        match self.open_envelope(&raw) {
            Some(content) => Some(content),
            None => {
                debug!(file = file_id, "invalid or expired cache entry, deleting");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Fetch file content only if its revalidation window still matches
    ///
    /// `fragment` is the freshly read card bytes at `window`; a cached entry
    /// whose bytes there differ is stale, deleted and reported as a miss.
    pub fn read_if_matches(
        &self,
        file_id: &str,
        window: (usize, usize),
        fragment: &[u8],
    ) -> Option<Vec<u8>> {
        let content = self.read(file_id)?;
        let (offset, length) = window;
        let cached = content.get(offset..offset + length)?;
        if cached == fragment {
            Some(content)
        } else {
            debug!(file = file_id, "card content changed, dropping cache entry");
            let _ = fs::remove_file(self.entry_path(file_id));
            None
        }
    }

    /// Sweep old card-instance groups in the background
    ///
    /// Keeps the newest `eviction_threshold` groups; a `None` threshold
    /// disables the sweep, as does a disabled cache. Runs detached so a slow
    /// disk never stalls a card operation.
    pub fn enforce_threshold(&self) {
        if self.keys.is_none() {
            return;
        }
        let Some(threshold) = self.eviction_threshold else {
            return;
        };
        let dir = self.dir.clone();
        let spawned = thread::Builder::new()
            .name("cache-sweep".into())
            .spawn(move || sweep_groups(&dir, threshold));
        if spawned.is_err() {
            warn!("could not start the cache sweep thread");
        }
    }

    fn entry_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.prefix, file_id))
    }

    fn write_at(&self, file_id: &str, content: &[u8], timestamp_millis: u64) {
        let Some(envelope) = self.seal_envelope(content, timestamp_millis) else {
            return;
        };
        if let Err(err) = fs::create_dir_all(&self.dir)
            .and_then(|()| fs::write(self.entry_path(file_id), envelope))
        {
            warn!(file = file_id, %err, "failed to write cache entry");
        }
    }

    fn seal_envelope(&self, content: &[u8], timestamp_millis: u64) -> Option<Vec<u8>> {
        let keys = self.keys.as_ref()?;
        let iv: [u8; IV_LEN] = rand::random();

        let body_len = 8 + content.len();
        let mut buf = vec![0u8; body_len + 16];
        buf[..8].copy_from_slice(&timestamp_millis.to_be_bytes());
        buf[8..body_len].copy_from_slice(content);
        let ciphertext = Aes128CbcEnc::new(&keys.enc.into(), &iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, body_len)
            .ok()?
            .to_vec();

        let mut mac = HmacSha256::new_from_slice(&keys.mac).ok()?;
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        envelope.extend_from_slice(&CACHE_FORMAT_VERSION.to_be_bytes());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&tag);
        envelope.extend_from_slice(&ciphertext);
        Some(envelope)
    }

    fn open_envelope(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let keys = self.keys.as_ref()?;
        if raw.len() < HEADER_LEN {
            return None;
        }
        let version = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if version != CACHE_FORMAT_VERSION {
            return None;
        }
        let iv = &raw[4..4 + IV_LEN];
        let tag = &raw[4 + IV_LEN..HEADER_LEN];
        let ciphertext = &raw[HEADER_LEN..];

        let mut mac = HmacSha256::new_from_slice(&keys.mac).ok()?;
        mac.update(ciphertext);
        mac.verify_slice(tag).ok()?;

        let mut buf = ciphertext.to_vec();
        let iv_arr: [u8; IV_LEN] = iv.try_into().ok()?;
        let body = Aes128CbcDec::new(&keys.enc.into(), &iv_arr.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .ok()?;
        if body.len() < 8 {
            return None;
        }

        let written = u64::from_be_bytes(body[..8].try_into().ok()?);
        let age = now_millis().saturating_sub(written);
        if age > self.validity.as_millis() as u64 {
            return None;
        }
        Some(body[8..].to_vec())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Delete the oldest card-instance groups beyond the threshold
///
/// Entries group by the text before the first `_` in their name. A group's
/// age is its oldest member's creation time (modification time where the
/// filesystem records no birth time).
fn sweep_groups(dir: &Path, threshold: usize) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut groups: Vec<(String, SystemTime, Vec<PathBuf>)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((group, _)) = name.split_once('_') else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };
        let stamp = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(UNIX_EPOCH);

        match groups.iter_mut().find(|(g, _, _)| g == group) {
            Some((_, oldest, paths)) => {
                if stamp < *oldest {
                    *oldest = stamp;
                }
                paths.push(path);
            }
            None => groups.push((group.to_string(), stamp, vec![path])),
        }
    }

    if groups.len() <= threshold {
        return;
    }
    // Newest groups survive
    groups.sort_by(|a, b| b.1.cmp(&a.1));
    for (group, _, paths) in groups.drain(threshold..) {
        debug!(group = %group, entries = paths.len(), "evicting cache group");
        for path in paths {
            let _ = fs::remove_file(path);
        }
    }
}
