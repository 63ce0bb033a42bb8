//! Four-layer key barrier: unseal key -> root key -> intermediate key ->
//! content key.
//!
//! The unseal key is never stored; it exists only as the Shamir
//! reconstruction of operator-held shares. Once reconstructed it decrypts
//! the root key, which in turn unwraps intermediate keys, which unwrap
//! content keys. Sealing the barrier zeroizes every unwrapped key held in
//! memory; only the sealed, wrapped forms persist in the repository.
//!
//! Each layer is a plain AES-256-GCM wrap keyed by an HKDF-SHA256 key
//! derived from the parent layer's key and the child's id, so compromising
//! one wrapped blob discloses nothing about its siblings.

use std::collections::HashMap;
use std::sync::Mutex;

use getrandom::getrandom;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use sharks::{Share, Sharks};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead;
use crate::error::{DecryptionError, EncodingError};

/// A raw 32-byte symmetric key at some barrier layer. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct BarrierKey([u8; 32]);

impl BarrierKey {
    pub fn generate() -> Result<Self, EncodingError> {
        let mut buf = [0u8; 32];
        getrandom(&mut buf).map_err(|_| EncodingError)?;
        Ok(Self(buf))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn fingerprint(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.0);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

/// A child key wrapped (encrypted) under its parent layer's key.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// An envelope produced by encrypting data under a content key.
///
/// `generation` pins the envelope to the specific key generation active at
/// `content_key_id` when it was sealed, so rotating that id later (see
/// [`Barrier::rotate`]) never strands an outstanding envelope: `decrypt`
/// looks the generation up directly instead of assuming "latest".
#[derive(Debug, Clone)]
pub struct Envelope {
    pub content_key_id: String,
    pub generation: u64,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Root,
    Intermediate,
    Content,
}

#[derive(Debug)]
pub enum BarrierError {
    Sealed,
    AlreadyUnsealed,
    InvalidShare,
    VerificationFailed,
    ThresholdNotMet { have: usize, need: usize },
    UnknownKey { layer: Layer, id: String },
    /// `rotate` was asked to rotate a layer with no rotation semantics of
    /// its own (the root key only changes via reseal/reinitialize).
    UnsupportedLayer(Layer),
    Crypto,
}

impl std::fmt::Display for BarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sealed => write!(f, "barrier is sealed"),
            Self::AlreadyUnsealed => write!(f, "barrier is already unsealed"),
            Self::InvalidShare => write!(f, "unseal share is malformed or does not belong to this barrier"),
            Self::VerificationFailed => write!(f, "reconstructed root key failed verification"),
            Self::ThresholdNotMet { have, need } => {
                write!(f, "unseal threshold not met: {have}/{need} shares submitted")
            }
            Self::UnknownKey { layer, id } => write!(f, "{layer:?} key not loaded: {id}"),
            Self::UnsupportedLayer(layer) => write!(f, "{layer:?} layer cannot be rotated through this API"),
            Self::Crypto => write!(f, "cryptographic operation failed"),
        }
    }
}

impl std::error::Error for BarrierError {}

impl From<EncodingError> for BarrierError {
    fn from(_: EncodingError) -> Self {
        Self::Crypto
    }
}

impl From<DecryptionError> for BarrierError {
    fn from(_: DecryptionError) -> Self {
        Self::Crypto
    }
}

fn derive_wrap_key(parent: &BarrierKey, purpose: &str, child_id: &str) -> Result<[u8; 32], EncodingError> {
    let info = alloc_info(purpose, child_id);
    let hk = Hkdf::<Sha256>::new(None, parent.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(&info, &mut out).map_err(|_| EncodingError)?;
    Ok(out)
}

fn alloc_info(purpose: &str, child_id: &str) -> Vec<u8> {
    let mut info = Vec::with_capacity(purpose.len() + child_id.len() + 16);
    info.extend_from_slice(b"kms-barrier|");
    info.extend_from_slice(purpose.as_bytes());
    info.push(b'|');
    info.extend_from_slice(child_id.as_bytes());
    info
}

fn wrap(parent: &BarrierKey, purpose: &str, child_id: &str, child: &BarrierKey) -> Result<WrappedKey, EncodingError> {
    let key = derive_wrap_key(parent, purpose, child_id)?;
    let nonce = aead::nonce()?;
    let ciphertext = aead::aead_seal(&key, &nonce, child.as_bytes(), child_id.as_bytes())?;
    Ok(WrappedKey { nonce, ciphertext })
}

fn unwrap(parent: &BarrierKey, purpose: &str, child_id: &str, wrapped: &WrappedKey) -> Result<BarrierKey, DecryptionError> {
    let key = derive_wrap_key(parent, purpose, child_id).map_err(|_| DecryptionError)?;
    let plaintext = aead::aead_open(&key, &wrapped.nonce, &wrapped.ciphertext, child_id.as_bytes())?;
    BarrierKey::from_slice(&plaintext).ok_or(DecryptionError)
}

/// Configuration chosen at `initialize` time: K-of-M Shamir shares needed
/// to reconstruct the unseal key. `M` is capped at 16 in line with typical
/// single-ceremony operator counts; larger pools should shard realms
/// across multiple barriers instead of raising this bound.
#[derive(Debug, Clone, Copy)]
pub struct UnsealConfig {
    pub threshold: u8,
    pub total_shares: u8,
}

impl UnsealConfig {
    pub const MAX_SHARES: u8 = 16;

    pub fn new(threshold: u8, total_shares: u8) -> Result<Self, BarrierError> {
        if threshold == 0 || total_shares == 0 || threshold > total_shares || total_shares > Self::MAX_SHARES {
            return Err(BarrierError::InvalidShare);
        }
        Ok(Self { threshold, total_shares })
    }
}

enum State {
    Sealed { pending_shares: Vec<Vec<u8>> },
    Unsealed { root: BarrierKey },
}

/// The four-layer key barrier.
///
/// `cache` holds every generation ever minted for a given `(layer, id)`,
/// oldest first; the last element is the active generation. Rotation
/// (`rotate`) appends rather than replaces, so an [`Envelope`] sealed under
/// an older generation stays decryptable after the id rotates ahead of it.
/// `content_parents` remembers which intermediate wraps a given content
/// key, so a content-key rotation can re-wrap without the caller having to
/// repeat the intermediate id.
pub struct Barrier {
    config: UnsealConfig,
    root_fingerprint: [u8; 32],
    state: Mutex<State>,
    cache: Mutex<HashMap<(Layer, String), Vec<BarrierKey>>>,
    content_parents: Mutex<HashMap<String, String>>,
}

/// Returned after each unseal share submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsealProgress {
    pub have: usize,
    pub need: usize,
    pub unsealed: bool,
}

impl Barrier {
    /// Generate a brand-new root key, split it into `config.total_shares`
    /// Shamir shares, and return a barrier in the unsealed state alongside
    /// the shares to hand to operators. The barrier never retains the
    /// shares or the combined root key's split form after this call.
    pub fn initialize(config: UnsealConfig) -> Result<(Self, Vec<Vec<u8>>), BarrierError> {
        let root = BarrierKey::generate()?;
        let sharks = Sharks(config.threshold);
        let dealer = sharks.dealer(root.as_bytes());
        let shares: Vec<Vec<u8>> = dealer.take(config.total_shares as usize).map(|s| Vec::from(&s)).collect();

        let barrier = Self {
            config,
            root_fingerprint: root.fingerprint(),
            state: Mutex::new(State::Unsealed { root }),
            cache: Mutex::new(HashMap::new()),
            content_parents: Mutex::new(HashMap::new()),
        };
        Ok((barrier, shares))
    }

    /// Reattach to a previously initialized barrier whose root fingerprint
    /// was persisted, starting sealed.
    pub fn sealed(config: UnsealConfig, root_fingerprint: [u8; 32]) -> Self {
        Self {
            config,
            root_fingerprint,
            state: Mutex::new(State::Sealed { pending_shares: Vec::new() }),
            cache: Mutex::new(HashMap::new()),
            content_parents: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_fingerprint(&self) -> [u8; 32] {
        self.root_fingerprint
    }

    pub fn is_sealed(&self) -> bool {
        matches!(*self.state.lock().expect("lock poisoned"), State::Sealed { .. })
    }

    /// Submit one unseal share. Once `threshold` distinct shares have been
    /// submitted, attempts reconstruction; a reconstructed key whose
    /// fingerprint doesn't match the one recorded at `initialize` is
    /// rejected as [`BarrierError::VerificationFailed`] and the pending
    /// buffer is cleared, forcing the ceremony to restart.
    pub fn submit_unseal_share(&self, share: Vec<u8>) -> Result<UnsealProgress, BarrierError> {
        let mut state = self.state.lock().expect("lock poisoned");
        match &mut *state {
            State::Unsealed { .. } => Err(BarrierError::AlreadyUnsealed),
            State::Sealed { pending_shares } => {
                if !pending_shares.iter().any(|s| s == &share) {
                    pending_shares.push(share);
                }
                let have = pending_shares.len();
                let need = self.config.threshold as usize;

                if have < need {
                    return Ok(UnsealProgress { have, need, unsealed: false });
                }

                let parsed: Result<Vec<Share>, _> =
                    pending_shares.iter().map(|s| Share::try_from(s.as_slice())).collect();
                let parsed = parsed.map_err(|_| BarrierError::InvalidShare)?;
                let secret = Sharks(self.config.threshold)
                    .recover(parsed.as_slice())
                    .map_err(|_| BarrierError::InvalidShare)?;
                let root = BarrierKey::from_slice(&secret).ok_or(BarrierError::InvalidShare)?;

                if root.fingerprint() != self.root_fingerprint {
                    pending_shares.clear();
                    return Err(BarrierError::VerificationFailed);
                }

                *state = State::Unsealed { root };
                Ok(UnsealProgress { have, need, unsealed: true })
            }
        }
    }

    /// Zeroize every unwrapped key in memory and drop back to sealed.
    pub fn seal(&self) {
        let mut cache = self.cache.lock().expect("lock poisoned");
        for (_, generations) in cache.drain() {
            for mut key in generations {
                key.zeroize();
            }
        }
        drop(cache);
        let mut state = self.state.lock().expect("lock poisoned");
        *state = State::Sealed { pending_shares: Vec::new() };
    }

    fn with_root<R>(&self, f: impl FnOnce(&BarrierKey) -> Result<R, BarrierError>) -> Result<R, BarrierError> {
        let state = self.state.lock().expect("lock poisoned");
        match &*state {
            State::Sealed { .. } => Err(BarrierError::Sealed),
            State::Unsealed { root } => f(root),
        }
    }

    /// Generate a brand-new intermediate key, wrap it under the root key,
    /// and cache the unwrapped form for subsequent content-key operations.
    pub fn create_intermediate(&self, id: &str) -> Result<WrappedKey, BarrierError> {
        let key = BarrierKey::generate()?;
        let wrapped = self.with_root(|root| Ok(wrap(root, "intermediate", id, &key)?))?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Intermediate, id.to_string()))
            .or_default()
            .push(key);
        Ok(wrapped)
    }

    /// Unwrap and cache an intermediate key previously produced by
    /// [`Barrier::create_intermediate`] and persisted by the caller.
    pub fn load_intermediate(&self, id: &str, wrapped: &WrappedKey) -> Result<(), BarrierError> {
        let key = self.with_root(|root| Ok(unwrap(root, "intermediate", id, wrapped)?))?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Intermediate, id.to_string()))
            .or_default()
            .push(key);
        Ok(())
    }

    /// Latest (active) generation of an intermediate key.
    fn intermediate(&self, id: &str) -> Result<BarrierKey, BarrierError> {
        if self.is_sealed() {
            return Err(BarrierError::Sealed);
        }
        self.cache
            .lock()
            .expect("lock poisoned")
            .get(&(Layer::Intermediate, id.to_string()))
            .and_then(|gens| gens.last())
            .cloned()
            .ok_or_else(|| BarrierError::UnknownKey {
                layer: Layer::Intermediate,
                id: id.to_string(),
            })
    }

    pub fn create_content_key(&self, intermediate_id: &str, content_id: &str) -> Result<WrappedKey, BarrierError> {
        let intermediate = self.intermediate(intermediate_id)?;
        let key = BarrierKey::generate()?;
        let wrapped = wrap(&intermediate, "content", content_id, &key)?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Content, content_id.to_string()))
            .or_default()
            .push(key);
        self.content_parents
            .lock()
            .expect("lock poisoned")
            .insert(content_id.to_string(), intermediate_id.to_string());
        Ok(wrapped)
    }

    pub fn load_content_key(
        &self,
        intermediate_id: &str,
        content_id: &str,
        wrapped: &WrappedKey,
    ) -> Result<(), BarrierError> {
        let intermediate = self.intermediate(intermediate_id)?;
        let key = unwrap(&intermediate, "content", content_id, wrapped)?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Content, content_id.to_string()))
            .or_default()
            .push(key);
        self.content_parents
            .lock()
            .expect("lock poisoned")
            .insert(content_id.to_string(), intermediate_id.to_string());
        Ok(())
    }

    /// `AddMaterial`'s import half: wrap caller-supplied key bytes as a new
    /// content-key generation instead of generating one. Used when the
    /// keystore imports external material rather than minting its own —
    /// everything downstream (rotation, encrypt/decrypt, eviction) treats
    /// an imported generation exactly like a generated one.
    pub fn import_content_key(
        &self,
        intermediate_id: &str,
        content_id: &str,
        key: BarrierKey,
    ) -> Result<WrappedKey, BarrierError> {
        let intermediate = self.intermediate(intermediate_id)?;
        let wrapped = wrap(&intermediate, "content", content_id, &key)?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Content, content_id.to_string()))
            .or_default()
            .push(key);
        self.content_parents
            .lock()
            .expect("lock poisoned")
            .insert(content_id.to_string(), intermediate_id.to_string());
        Ok(wrapped)
    }

    /// Latest (active) generation of a content key, alongside its index for
    /// stamping new envelopes.
    fn content_latest(&self, id: &str) -> Result<(u64, BarrierKey), BarrierError> {
        if self.is_sealed() {
            return Err(BarrierError::Sealed);
        }
        let cache = self.cache.lock().expect("lock poisoned");
        let gens = cache.get(&(Layer::Content, id.to_string())).ok_or_else(|| BarrierError::UnknownKey {
            layer: Layer::Content,
            id: id.to_string(),
        })?;
        let key = gens.last().ok_or_else(|| BarrierError::UnknownKey {
            layer: Layer::Content,
            id: id.to_string(),
        })?;
        Ok(((gens.len() - 1) as u64, key.clone()))
    }

    /// A specific generation of a content key, used to decrypt envelopes
    /// sealed before a later rotation.
    fn content_at(&self, id: &str, generation: u64) -> Result<BarrierKey, BarrierError> {
        if self.is_sealed() {
            return Err(BarrierError::Sealed);
        }
        self.cache
            .lock()
            .expect("lock poisoned")
            .get(&(Layer::Content, id.to_string()))
            .and_then(|gens| gens.get(generation as usize))
            .cloned()
            .ok_or_else(|| BarrierError::UnknownKey {
                layer: Layer::Content,
                id: id.to_string(),
            })
    }

    fn content(&self, id: &str) -> Result<BarrierKey, BarrierError> {
        self.content_latest(id).map(|(_, key)| key)
    }

    /// Encrypt `plaintext` under the content key `content_key_id`, binding
    /// `aad` (typically tenant id + key id) into the AEAD tag. The envelope
    /// records which generation of `content_key_id` produced it so a later
    /// rotation of that id doesn't strand it.
    pub fn encrypt(&self, content_key_id: &str, plaintext: &[u8], aad: &[u8]) -> Result<Envelope, BarrierError> {
        let (generation, key) = self.content_latest(content_key_id)?;
        let nonce = aead::nonce()?;
        let ciphertext = aead::aead_seal(key.as_bytes(), &nonce, plaintext, aad)?;
        Ok(Envelope {
            content_key_id: content_key_id.to_string(),
            generation,
            nonce,
            ciphertext,
        })
    }

    pub fn decrypt(&self, envelope: &Envelope, aad: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let key = self.content_at(&envelope.content_key_id, envelope.generation)?;
        let plaintext = aead::aead_open(key.as_bytes(), &envelope.nonce, &envelope.ciphertext, aad)?;
        Ok(plaintext)
    }

    /// Rotate the active key at `(layer, id)`: mint a new generation, wrap
    /// it under the layer above, and push it onto the id's generation
    /// history so the previous generation is demoted (superseded) rather
    /// than discarded. Envelopes sealed under the old generation keep
    /// decrypting because [`Envelope::generation`] addresses it directly;
    /// only callers asking for the "current" key (`encrypt`, a fresh
    /// `create_content_key` under a rotated intermediate) observe the new
    /// one. The push happens under a single lock acquisition, so concurrent
    /// readers see either the old generation list or the new one, never a
    /// partial update.
    ///
    /// `Layer::Root` has no rotation of its own here — the root only
    /// changes via reseal and a fresh `initialize`.
    pub fn rotate(&self, layer: Layer, id: &str) -> Result<WrappedKey, BarrierError> {
        match layer {
            Layer::Root => Err(BarrierError::UnsupportedLayer(layer)),
            Layer::Intermediate => self.rotate_intermediate(id),
            Layer::Content => self.rotate_content(id),
        }
    }

    fn rotate_intermediate(&self, id: &str) -> Result<WrappedKey, BarrierError> {
        // Rotating requires an existing active generation; you can't rotate
        // a key that was never created.
        self.intermediate(id)?;
        let key = BarrierKey::generate()?;
        let wrapped = self.with_root(|root| Ok(wrap(root, "intermediate", id, &key)?))?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Intermediate, id.to_string()))
            .or_default()
            .push(key);
        Ok(wrapped)
    }

    fn rotate_content(&self, id: &str) -> Result<WrappedKey, BarrierError> {
        let intermediate_id = self
            .content_parents
            .lock()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| BarrierError::UnknownKey { layer: Layer::Content, id: id.to_string() })?;
        let intermediate = self.intermediate(&intermediate_id)?;
        let key = BarrierKey::generate()?;
        let wrapped = wrap(&intermediate, "content", id, &key)?;
        self.cache
            .lock()
            .expect("lock poisoned")
            .entry((Layer::Content, id.to_string()))
            .or_default()
            .push(key);
        Ok(wrapped)
    }

    /// HMAC-SHA256 over `message` keyed by the content key `content_key_id`.
    /// Keeps the raw key inside the barrier rather than exporting it — the
    /// HMAC family's "signature" is a MAC over the same unwrapped content
    /// key the AES family would use for an envelope.
    pub fn mac(&self, content_key_id: &str, message: &[u8]) -> Result<Vec<u8>, BarrierError> {
        use hmac::{Hmac, Mac};
        let key = self.content(content_key_id)?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes()).map_err(|_| BarrierError::Crypto)?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time verification of a tag produced by [`Barrier::mac`].
    pub fn mac_verify(&self, content_key_id: &str, message: &[u8], tag: &[u8]) -> Result<bool, BarrierError> {
        use hmac::{Hmac, Mac};
        let key = self.content(content_key_id)?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes()).map_err(|_| BarrierError::Crypto)?;
        mac.update(message);
        Ok(mac.verify_slice(tag).is_ok())
    }

    /// Forget every generation of an unwrapped key without sealing the
    /// whole barrier, e.g. once all envelopes referencing it are known
    /// expired.
    pub fn evict(&self, layer: Layer, id: &str) {
        if let Some(generations) = self.cache.lock().expect("lock poisoned").remove(&(layer, id.to_string())) {
            for mut key in generations {
                key.zeroize();
            }
        }
        if layer == Layer::Content {
            self.content_parents.lock().expect("lock poisoned").remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> UnsealConfig {
        UnsealConfig::new(2, 3).unwrap()
    }

    #[test]
    fn unseal_requires_threshold_shares() {
        let (barrier, shares) = Barrier::initialize(small_config()).unwrap();
        barrier.seal();
        assert!(barrier.is_sealed());

        let progress = barrier.submit_unseal_share(shares[0].clone()).unwrap();
        assert!(!progress.unsealed);
        assert!(barrier.is_sealed());

        let progress = barrier.submit_unseal_share(shares[1].clone()).unwrap();
        assert!(progress.unsealed);
        assert!(!barrier.is_sealed());
    }

    #[test]
    fn resealing_zeroizes_and_requires_reunseal() {
        let (barrier, shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.seal();

        assert!(matches!(barrier.create_content_key("im1", "ck1"), Err(BarrierError::Sealed)));

        barrier.submit_unseal_share(shares[0].clone()).unwrap();
        barrier.submit_unseal_share(shares[1].clone()).unwrap();
        // intermediate cache was zeroized on seal, must be reloaded.
        assert!(matches!(
            barrier.create_content_key("im1", "ck1"),
            Err(BarrierError::UnknownKey { .. })
        ));
    }

    #[test]
    fn envelope_round_trips_through_all_layers() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        let wrapped_im = barrier.create_intermediate("im1").unwrap();
        let wrapped_ck = barrier.create_content_key("im1", "ck1").unwrap();

        let env = barrier.encrypt("ck1", b"hello realm", b"tenant-a|ck1").unwrap();
        let pt = barrier.decrypt(&env, b"tenant-a|ck1").unwrap();
        assert_eq!(pt, b"hello realm");

        // Fresh barrier instance reloading from wrapped forms only.
        let (barrier2, _) = Barrier::initialize(small_config()).unwrap();
        barrier2.load_intermediate("im1", &wrapped_im).err(); // wrong root, expected to fail
        let _ = wrapped_ck;
    }

    #[test]
    fn wrong_aad_fails_decrypt() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.create_content_key("im1", "ck1").unwrap();

        let env = barrier.encrypt("ck1", b"hello realm", b"tenant-a|ck1").unwrap();
        assert!(barrier.decrypt(&env, b"tenant-b|ck1").is_err());
    }

    #[test]
    fn mac_round_trips_and_rejects_tamper() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.create_content_key("im1", "ck1").unwrap();

        let tag = barrier.mac("ck1", b"hello realm").unwrap();
        assert!(barrier.mac_verify("ck1", b"hello realm", &tag).unwrap());
        assert!(!barrier.mac_verify("ck1", b"goodbye realm", &tag).unwrap());

        let mut bad_tag = tag.clone();
        bad_tag[0] ^= 0xff;
        assert!(!barrier.mac_verify("ck1", b"hello realm", &bad_tag).unwrap());
    }

    #[test]
    fn rotating_content_key_keeps_old_envelopes_decryptable() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.create_content_key("im1", "ck1").unwrap();

        let before = barrier.encrypt("ck1", b"x", b"aad").unwrap();
        barrier.rotate(Layer::Content, "ck1").unwrap();
        let after = barrier.encrypt("ck1", b"y", b"aad").unwrap();

        assert_ne!(before.generation, after.generation);
        assert_eq!(barrier.decrypt(&before, b"aad").unwrap(), b"x");
        assert_eq!(barrier.decrypt(&after, b"aad").unwrap(), b"y");
    }

    #[test]
    fn rotating_intermediate_preserves_existing_content_key() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.create_content_key("im1", "ck1").unwrap();
        let env = barrier.encrypt("ck1", b"hello", b"aad").unwrap();

        barrier.rotate(Layer::Intermediate, "im1").unwrap();

        assert_eq!(barrier.decrypt(&env, b"aad").unwrap(), b"hello");
    }

    #[test]
    fn rotate_unknown_id_fails() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        assert!(matches!(
            barrier.rotate(Layer::Intermediate, "missing"),
            Err(BarrierError::UnknownKey { .. })
        ));
        assert!(matches!(
            barrier.rotate(Layer::Content, "missing"),
            Err(BarrierError::UnknownKey { .. })
        ));
    }

    #[test]
    fn rotate_root_is_unsupported() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        assert!(matches!(barrier.rotate(Layer::Root, "root"), Err(BarrierError::UnsupportedLayer(_))));
    }

    #[test]
    fn mac_rejects_when_sealed() {
        let (barrier, _shares) = Barrier::initialize(small_config()).unwrap();
        barrier.create_intermediate("im1").unwrap();
        barrier.create_content_key("im1", "ck1").unwrap();
        barrier.seal();
        assert!(matches!(barrier.mac("ck1", b"x"), Err(BarrierError::Sealed)));
    }
}
