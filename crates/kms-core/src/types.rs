//! Core types: realm/tenant ids, key identifiers, algorithm families, the
//! key lifecycle state machine, and the elastic key pool's metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Realm / tenant context (C8)
// ---------------------------------------------------------------------------

/// Identifies the tenant a request is scoped to. Every repository query and
/// barrier operation takes one of these; there is no "global" query that
/// spans tenants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Key identifiers
// ---------------------------------------------------------------------------

/// Unique key identifier (hex-encoded random bytes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// Create a new random KeyId.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Create from a specific string (for testing/deterministic use).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

use rand_core::RngCore;

/// Policy identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Key classification
// ---------------------------------------------------------------------------

/// Position in the key hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Root key — offline, protects the entire hierarchy.
    Root,
    /// Domain key — per-tenant or per-environment.
    Domain,
    /// Key-encrypting key — wraps DEKs.
    KeyEncrypting,
    /// Data-encrypting key — directly encrypts user data.
    DataEncrypting,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Root => write!(f, "ROOT"),
            KeyType::Domain => write!(f, "DOMAIN"),
            KeyType::KeyEncrypting => write!(f, "KEK"),
            KeyType::DataEncrypting => write!(f, "DEK"),
        }
    }
}

// ---------------------------------------------------------------------------
// Algorithm families (C6) — what crypto operations a key supports
// ---------------------------------------------------------------------------

/// The cryptographic family a key belongs to. Determines which operations
/// in [`crate::crypto`] accept it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmFamily {
    Rsa,
    Ec,
    EdDsa,
    Ecdh,
    Aes,
    Hmac,
}

/// The operations an [`AlgorithmFamily`] permits. Dispatch tables like this
/// are how `encrypt`/`sign`/etc. reject a key up front instead of failing
/// deep inside a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermittedOperations {
    pub encrypt: bool,
    pub decrypt: bool,
    pub sign: bool,
    pub verify: bool,
    pub derive: bool,
    pub wrap: bool,
}

impl AlgorithmFamily {
    pub fn permitted_operations(&self) -> PermittedOperations {
        match self {
            AlgorithmFamily::Rsa => PermittedOperations {
                encrypt: true,
                decrypt: true,
                sign: true,
                verify: true,
                derive: false,
                wrap: true,
            },
            AlgorithmFamily::Ec => PermittedOperations {
                encrypt: false,
                decrypt: false,
                sign: true,
                verify: true,
                derive: false,
                wrap: false,
            },
            AlgorithmFamily::EdDsa => PermittedOperations {
                encrypt: false,
                decrypt: false,
                sign: true,
                verify: true,
                derive: false,
                wrap: false,
            },
            AlgorithmFamily::Ecdh => PermittedOperations {
                encrypt: false,
                decrypt: false,
                sign: false,
                verify: false,
                derive: true,
                wrap: false,
            },
            AlgorithmFamily::Aes => PermittedOperations {
                encrypt: true,
                decrypt: true,
                sign: false,
                verify: false,
                derive: false,
                wrap: true,
            },
            AlgorithmFamily::Hmac => PermittedOperations {
                encrypt: false,
                decrypt: false,
                sign: true,
                verify: true,
                derive: false,
                wrap: false,
            },
        }
    }
}

impl fmt::Display for AlgorithmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlgorithmFamily::Rsa => "RSA",
            AlgorithmFamily::Ec => "EC",
            AlgorithmFamily::EdDsa => "Ed25519",
            AlgorithmFamily::Ecdh => "X25519",
            AlgorithmFamily::Aes => "AES",
            AlgorithmFamily::Hmac => "HMAC",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Key material provider (C5 data model)
// ---------------------------------------------------------------------------

/// Where a pool's key material is held. `Internal` is the only provider
/// this build actually generates against — the rest round-trip through
/// storage and the API so a tenant's inventory can record externally-held
/// keys, but `generate`/`rotate` refuse anything but `Internal` (see
/// `Keystore::generate`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyProvider {
    Internal,
    Aws,
    Gcp,
    Azure,
}

impl fmt::Display for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyProvider::Internal => "internal",
            KeyProvider::Aws => "aws",
            KeyProvider::Gcp => "gcp",
            KeyProvider::Azure => "azure",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Key lifecycle state machine
// ---------------------------------------------------------------------------

/// Key lifecycle state.
///
/// ```text
/// PENDING → ACTIVE ↔ ROTATED → EXPIRED → DESTROYED
///             │
///             └──→ REVOKED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// Generated but not yet activated.
    Pending,
    /// Active — can encrypt and decrypt.
    Active,
    /// Rotated — superseded by a new version. Can still decrypt (grace period).
    Rotated,
    /// Expired — can no longer encrypt or decrypt.
    Expired,
    /// Revoked — emergency deactivation. Cannot be reactivated.
    Revoked,
    /// Destroyed — key material has been purged.
    Destroyed,
}

impl KeyState {
    /// Whether this state allows encryption.
    pub fn can_encrypt(&self) -> bool {
        matches!(self, KeyState::Active)
    }

    /// Whether this state allows decryption. EXPIRED material stays
    /// decrypt/verify-able — expiry blocks new encrypt/sign operations, not
    /// reads of data already sealed under it. Only DESTROYED (material
    /// purged) and REVOKED (emergency deactivation) cut this off.
    pub fn can_decrypt(&self) -> bool {
        matches!(self, KeyState::Active | KeyState::Rotated | KeyState::Expired)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &[KeyState] {
        match self {
            KeyState::Pending => &[KeyState::Active, KeyState::Destroyed],
            KeyState::Active => &[KeyState::Rotated, KeyState::Revoked, KeyState::Expired],
            KeyState::Rotated => &[KeyState::Expired],
            KeyState::Expired => &[KeyState::Destroyed],
            KeyState::Revoked => &[KeyState::Destroyed],
            KeyState::Destroyed => &[],
        }
    }

    /// Check if transitioning to `target` is valid.
    pub fn can_transition_to(&self, target: KeyState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyState::Pending => write!(f, "PENDING"),
            KeyState::Active => write!(f, "ACTIVE"),
            KeyState::Rotated => write!(f, "ROTATED"),
            KeyState::Expired => write!(f, "EXPIRED"),
            KeyState::Revoked => write!(f, "REVOKED"),
            KeyState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Key version (tracks rotation history — the "elastic" part of the pool:
// versions accumulate as the key rotates and old ones retire to decrypt-only)
// ---------------------------------------------------------------------------

/// A specific version of a key (created on generation or rotation).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyVersion {
    /// Version number (1, 2, 3, ...).
    pub version: u32,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
    /// Serialized public key bytes (hex). Empty for symmetric algorithms.
    pub public_key_hex: String,
    /// Serialized secret/content key bytes (hex), wrapped by the barrier's
    /// intermediate key for this tenant before being handed to storage.
    pub secret_key_hex: String,
    /// Id of the barrier content key this version is wrapped under.
    pub content_key_id: String,
    /// Revoked at the single-version grain (`RevokeMaterial`), distinct from
    /// whole-key revocation. A revoked version is skipped when picking the
    /// target for encrypt/sign but remains usable for decrypt/verify.
    #[serde(default)]
    pub revoked: bool,
}

// ---------------------------------------------------------------------------
// Key metadata
// ---------------------------------------------------------------------------

/// Complete metadata for a managed key, scoped to exactly one tenant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Owning tenant. Every lookup must be scoped by this.
    pub tenant_id: TenantId,
    /// Unique identifier (unique within the tenant).
    pub id: KeyId,
    /// Human-readable name. Unique within the tenant, immutable after
    /// creation.
    pub name: String,
    /// Free-text operator note. Never interpreted, never unique.
    #[serde(default)]
    pub description: String,
    /// Name of the elastic pool this key belongs to within the tenant.
    pub pool_name: String,
    /// Where this pool's material is held. Immutable after creation.
    #[serde(default = "default_provider")]
    pub provider: KeyProvider,
    /// Position in hierarchy.
    pub key_type: KeyType,
    /// Cryptographic family, gating which operations in `crypto` accept it.
    pub algorithm: AlgorithmFamily,
    /// Current lifecycle state.
    pub state: KeyState,
    /// Associated policy (if any).
    pub policy_id: Option<PolicyId>,
    /// Parent key in the hierarchy (None for root).
    pub parent_id: Option<KeyId>,
    /// Whether `rotate` may create new versions of this key.
    pub versioning_allowed: bool,
    /// Whether external key material may be imported into this key.
    pub import_allowed: bool,
    /// Whether this key's secret material may ever be exported.
    pub export_allowed: bool,
    /// When this key was first created.
    pub created_at: DateTime<Utc>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
    /// When the key was activated.
    pub activated_at: Option<DateTime<Utc>>,
    /// When the key was rotated (entered ROTATED state).
    pub rotated_at: Option<DateTime<Utc>>,
    /// When the key was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// When the key was destroyed.
    pub destroyed_at: Option<DateTime<Utc>>,
    /// All versions (current + historical).
    pub versions: Vec<KeyVersion>,
    /// Current (latest) version number.
    pub current_version: u32,
    /// Number of times this key has been used for encryption.
    pub usage_count: u64,
    /// Arbitrary metadata tags.
    pub tags: std::collections::HashMap<String, String>,
    /// `DisablePool`: blocks future `AddMaterial` (rotate) calls without
    /// touching the lifecycle state of material already issued. Distinct
    /// from `revoke`, which invalidates encrypt/sign for the whole key.
    #[serde(default)]
    pub pool_disabled: bool,
}

fn default_provider() -> KeyProvider {
    KeyProvider::Internal
}

impl KeyMetadata {
    /// Get the current (latest) version.
    pub fn current_key_version(&self) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.version == self.current_version)
    }

    /// Look up a specific version by number, for explicit-version
    /// decrypt/verify targeting.
    pub fn version(&self, version: u32) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// Duration since activation (if activated).
    pub fn age(&self) -> Option<chrono::Duration> {
        self.activated_at.map(|a| Utc::now() - a)
    }
}

impl kms_repository::Entity for KeyMetadata {
    fn entity_id(&self) -> String {
        self.id.as_str().to_string()
    }

    fn table_name() -> &'static str {
        "kms_keys"
    }
}
