//! Error types for the keystore.

use crate::types::{KeyId, KeyState};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error kind taxonomy — what the API layer maps to HTTP status codes
// ---------------------------------------------------------------------------

/// Coarse classification every [`KeystoreError`] collapses to. The API
/// surface maps these 1:1 to status codes; nothing downstream of `kind()`
/// should need to match on the finer-grained variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Sealed,
    Integrity,
    Internal,
}

// ---------------------------------------------------------------------------
// Top-level keystore error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum KeystoreError {
    KeyNotFound(KeyId),
    InvalidTransition { id: KeyId, from: KeyState, to: KeyState },
    PolicyViolation(String),
    StorageError(String),
    EnvelopeError(String),
    DuplicateKey(KeyId),
    /// `(tenant_id, name)` collision on `CreatePool` — `name` is unique
    /// within a tenant and immutable, so a second pool with the same name
    /// is rejected before any row is written.
    DuplicateName { tenant_id: String, name: String },
    KeyDestroyed(KeyId),
    NotActive(KeyId),
    NotDecryptable(KeyId),
    PolicyNotFound(String),
    /// Key's algorithm family does not permit the attempted operation.
    OperationNotPermitted { id: KeyId, operation: &'static str },
    /// `rotate`/import attempted against a pool whose `versioning_allowed`
    /// flag is off. Distinct from `OperationNotPermitted`: this is a
    /// conflict with the pool's own configuration, not a missing grant, so
    /// it maps to `AlreadyExists` (409) rather than `PermissionDenied` (403).
    VersioningDisabled(KeyId),
    /// The barrier has not been unsealed yet.
    Sealed,
    /// A wrapped key's integrity check (AEAD tag, fingerprint) failed.
    IntegrityViolation(String),
    /// Caller-supplied key material for `import` is malformed for the
    /// target algorithm family (wrong length, unparseable DER, ...).
    InvalidMaterial(String),
}

impl KeystoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyNotFound(_) | Self::PolicyNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateKey(_) | Self::DuplicateName { .. } | Self::VersioningDisabled(_) => {
                ErrorKind::AlreadyExists
            }
            Self::InvalidTransition { .. }
            | Self::PolicyViolation(_)
            | Self::NotActive(_)
            | Self::NotDecryptable(_)
            | Self::InvalidMaterial(_) => ErrorKind::InvalidArgument,
            Self::OperationNotPermitted { .. } | Self::KeyDestroyed(_) => ErrorKind::PermissionDenied,
            Self::Sealed => ErrorKind::Sealed,
            Self::IntegrityViolation(_) => ErrorKind::Integrity,
            Self::StorageError(_) | Self::EnvelopeError(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for KeystoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "key not found: {}", id),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {}: {} → {}", id, from, to)
            }
            Self::PolicyViolation(msg) => write!(f, "policy violation: {}", msg),
            Self::StorageError(msg) => write!(f, "storage error: {}", msg),
            Self::EnvelopeError(msg) => write!(f, "envelope error: {}", msg),
            Self::DuplicateKey(id) => write!(f, "duplicate key: {}", id),
            Self::DuplicateName { tenant_id, name } => {
                write!(f, "pool named '{}' already exists for tenant {}", name, tenant_id)
            }
            Self::KeyDestroyed(id) => write!(f, "key destroyed: {}", id),
            Self::NotActive(id) => write!(f, "key not active: {}", id),
            Self::NotDecryptable(id) => write!(f, "key cannot decrypt: {}", id),
            Self::PolicyNotFound(id) => write!(f, "policy not found: {}", id),
            Self::OperationNotPermitted { id, operation } => {
                write!(f, "key {} does not permit {}", id, operation)
            }
            Self::VersioningDisabled(id) => {
                write!(f, "key {} has versioning_allowed=false, cannot add material", id)
            }
            Self::Sealed => write!(f, "barrier is sealed"),
            Self::IntegrityViolation(msg) => write!(f, "integrity violation: {}", msg),
            Self::InvalidMaterial(msg) => write!(f, "invalid key material: {}", msg),
        }
    }
}

impl std::error::Error for KeystoreError {}

impl From<kms_repository::RepositoryError> for KeystoreError {
    fn from(e: kms_repository::RepositoryError) -> Self {
        use kms_repository::RepositoryError as R;
        match e {
            R::NotFound { id, .. } => Self::KeyNotFound(KeyId::new(id)),
            R::AlreadyExists { id, .. } => Self::DuplicateKey(KeyId::new(id)),
            R::InvalidArgument(msg) => Self::StorageError(msg),
            R::Internal(msg) => Self::StorageError(msg),
        }
    }
}

impl From<kms_barrier::barrier::BarrierError> for KeystoreError {
    fn from(e: kms_barrier::barrier::BarrierError) -> Self {
        use kms_barrier::barrier::BarrierError as B;
        match e {
            B::Sealed => Self::Sealed,
            B::VerificationFailed => Self::IntegrityViolation(e.to_string()),
            other => Self::EnvelopeError(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Specific operation errors (type-safe)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GenerateError(pub KeystoreError);
impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for GenerateError {}
impl From<KeystoreError> for GenerateError {
    fn from(e: KeystoreError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct LifecycleError(pub KeystoreError);
impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for LifecycleError {}
impl From<KeystoreError> for LifecycleError {
    fn from(e: KeystoreError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct RotateError(pub KeystoreError);
impl fmt::Display for RotateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for RotateError {}
impl From<KeystoreError> for RotateError {
    fn from(e: KeystoreError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct ExpireError(pub KeystoreError);
impl fmt::Display for ExpireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for ExpireError {}
impl From<KeystoreError> for ExpireError {
    fn from(e: KeystoreError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct EncryptError(pub String);
impl fmt::Display for EncryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "encrypt: {}", self.0) }
}
impl std::error::Error for EncryptError {}

#[derive(Debug)]
pub struct DecryptError(pub String);
impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "decrypt: {}", self.0) }
}
impl std::error::Error for DecryptError {}

#[derive(Debug)]
pub struct SignError(pub String);
impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "sign: {}", self.0) }
}
impl std::error::Error for SignError {}

#[derive(Debug)]
pub struct VerifyError(pub String);
impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "verify: {}", self.0) }
}
impl std::error::Error for VerifyError {}

// ---------------------------------------------------------------------------
// Expiration decision types
// ---------------------------------------------------------------------------

/// Why a key needs expiration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpirationSource {
    /// ROTATED key past its grace period.
    GracePeriodExpired,
    /// ACTIVE key past its max_lifetime.
    MaxLifetimeExceeded,
}

/// Result of checking whether a key should expire.
#[derive(Clone, Debug)]
pub enum ExpirationDecision {
    /// Key does not need expiration.
    NotNeeded,
    /// Key should be expired now.
    Required {
        reason: String,
        source: ExpirationSource,
    },
    /// Key will expire soon (warning threshold).
    Warning {
        reason: String,
        remaining: Duration,
        source: ExpirationSource,
    },
}

impl ExpirationDecision {
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required { .. })
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }

    pub fn source(&self) -> Option<&ExpirationSource> {
        match self {
            Self::Required { source, .. } => Some(source),
            Self::Warning { source, .. } => Some(source),
            Self::NotNeeded => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Destroy decision
// ---------------------------------------------------------------------------

/// Result of checking whether a key can be destroyed.
#[derive(Clone, Debug)]
pub enum DestroyDecision {
    /// Safe to destroy.
    Safe { reason: String },
    /// Blocked — key still in use.
    Blocked { reason: String },
}

impl DestroyDecision {
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe { .. })
    }
}

// ---------------------------------------------------------------------------
// Expiration report (bulk operations)
// ---------------------------------------------------------------------------

/// Report from bulk expiration processing.
#[derive(Clone, Debug, Default)]
pub struct ExpirationReport {
    pub expired: Vec<(KeyId, ExpirationSource)>,
    pub warnings: Vec<(KeyId, String, Duration)>,
    pub failed: Vec<(KeyId, String)>,
    pub skipped: usize,
}
