//! Elastic key pool (C5) and cryptographic operations (C6): key lifecycle
//! management with policy, audit, and barrier-backed envelope integration,
//! scoped to a realm on every call (C8).

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::error::*;
use crate::policy::{self, KeyPolicy};
use crate::storage::KeyRepository;
use crate::threat::{PolicyAdapter, SecurityMetrics, ThreatAssessor, ThreatConfig, ThreatEvent, ThreatEventKind, ThreatLevel};
use crate::types::*;

use chrono::Utc;
use ed25519_dalek::{Signature as Ed25519Signature, SigningKey as Ed25519SigningKey, VerifyingKey as Ed25519VerifyingKey};
use kms_barrier::barrier::{Barrier, BarrierKey, Envelope as BarrierEnvelope, Layer as BarrierLayer};
use kms_barrier::{Aad, Context, HybridEngine, PublicKey, SecretKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pss::{SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// RSA modulus size for keys this build generates. 2048 bits is the floor
/// most compliance regimes still accept; nothing here stops a future bump
/// to 3072/4096 since the modulus size isn't wire-encoded anywhere.
const RSA_KEY_BITS: usize = 2048;

// ---------------------------------------------------------------------------
// Encrypted blob (output of convenience encrypt)
// ---------------------------------------------------------------------------

/// A ciphertext with metadata about which key encrypted it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EncryptedBlob {
    /// Which key ID was used.
    pub key_id: String,
    /// Which version of that key.
    pub key_version: u32,
    /// The ciphertext bytes (hex-encoded for JSON safety).
    pub ciphertext_hex: String,
    /// Nonce used for symmetric (AES/HMAC family) encryption, empty for
    /// asymmetric families whose wire format carries its own nonce.
    pub nonce_hex: String,
    /// When this blob was created.
    pub encrypted_at: chrono::DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

pub struct Keystore {
    repo: Arc<KeyRepository>,
    barrier: Arc<Barrier>,
    engine: HybridEngine,
    audit: Arc<dyn AuditSinkSync>,
    policies: HashMap<String, KeyPolicy>,
    threat: Mutex<ThreatAssessor>,
    /// Tenants whose barrier intermediate key has already been created in
    /// this process. One intermediate per tenant; everything that tenant
    /// owns wraps under it.
    tenant_intermediates: Mutex<HashSet<String>>,
    /// Content keys already created under their tenant's intermediate.
    content_keys: Mutex<HashSet<String>>,
    /// Pre-warmed RSA keypairs (C1). Only RSA keygen is slow enough to
    /// warrant pooling — EC/EdDSA keygen is cheap native scalar arithmetic
    /// and happens inline in `new_version`; ECDH keeps drawing from
    /// `engine.generate_keypair()` directly since it isn't pool-eligible
    /// (`PublicKey`/`SecretKey` aren't `Send + 'static` owners of a stable
    /// shape the way a single `RsaPrivateKey` is).
    rsa_pool: Arc<kms_pool::GeneratorPool<RsaPrivateKey>>,
}

fn generate_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand_core::OsRng, RSA_KEY_BITS).expect("rsa keygen")
}

impl Keystore {
    /// Create a new keystore with the given repository, barrier, and audit sink.
    pub fn new(repo: Arc<KeyRepository>, barrier: Arc<Barrier>, audit: Arc<dyn AuditSinkSync>) -> Self {
        Self {
            repo,
            barrier,
            engine: HybridEngine::new(),
            audit: audit.clone(),
            policies: HashMap::new(),
            threat: Mutex::new(ThreatAssessor::new(ThreatConfig::default()).with_audit(audit)),
            tenant_intermediates: Mutex::new(HashSet::new()),
            content_keys: Mutex::new(HashSet::new()),
            rsa_pool: Arc::new(kms_pool::GeneratorPool::new(generate_rsa_key, kms_pool::PoolConfig::default(), 2)),
        }
    }

    /// Create with custom threat configuration.
    pub fn with_threat_config(
        repo: Arc<KeyRepository>,
        barrier: Arc<Barrier>,
        audit: Arc<dyn AuditSinkSync>,
        threat_config: ThreatConfig,
    ) -> Self {
        Self {
            repo,
            barrier,
            engine: HybridEngine::new(),
            audit: audit.clone(),
            policies: HashMap::new(),
            threat: Mutex::new(ThreatAssessor::new(threat_config).with_audit(audit)),
            tenant_intermediates: Mutex::new(HashSet::new()),
            content_keys: Mutex::new(HashSet::new()),
            rsa_pool: Arc::new(kms_pool::GeneratorPool::new(generate_rsa_key, kms_pool::PoolConfig::default(), 2)),
        }
    }

    // -----------------------------------------------------------------------
    // Policy management
    // -----------------------------------------------------------------------

    /// Register a policy.
    pub fn register_policy(&mut self, policy: KeyPolicy) {
        self.audit.record(AuditEvent::system_event(
            AuditAction::PolicyRegistered {
                policy_id: policy.id.as_str().to_string(),
            },
        ));
        self.policies.insert(policy.id.as_str().to_string(), policy);
    }

    /// Get a registered policy.
    pub fn get_policy(&self, id: &PolicyId) -> Option<&KeyPolicy> {
        self.policies.get(id.as_str())
    }

    // -----------------------------------------------------------------------
    // Barrier plumbing — content-key wrapping per tenant
    // -----------------------------------------------------------------------

    fn tenant_intermediate_id(tenant_id: &TenantId) -> String {
        format!("tenant:{tenant_id}")
    }

    /// Ensure `tenant_id` has a barrier intermediate key and `content_id`
    /// has a content key wrapped under it, creating either as needed.
    fn ensure_content_key(&self, tenant_id: &TenantId, content_id: &str) -> Result<(), KeystoreError> {
        let inter_id = Self::tenant_intermediate_id(tenant_id);
        {
            let mut created = self.tenant_intermediates.lock().expect("lock poisoned");
            if !created.contains(&inter_id) {
                self.barrier.create_intermediate(&inter_id)?;
                created.insert(inter_id.clone());
            }
        }
        let mut content_created = self.content_keys.lock().expect("lock poisoned");
        if !content_created.contains(content_id) {
            self.barrier.create_content_key(&inter_id, content_id)?;
            content_created.insert(content_id.to_string());
        }
        Ok(())
    }

    fn content_key_id(tenant_id: &TenantId, key_id: &KeyId, version: u32) -> String {
        format!("{tenant_id}:{key_id}:{version}")
    }

    fn wrap_bytes(&self, tenant_id: &TenantId, key_id: &KeyId, content_id: &str, plaintext: &[u8]) -> Result<BarrierEnvelope, KeystoreError> {
        self.ensure_content_key(tenant_id, content_id)?;
        let aad = format!("{tenant_id}:{key_id}");
        Ok(self.barrier.encrypt(content_id, plaintext, aad.as_bytes())?)
    }

    fn unwrap_bytes(&self, tenant_id: &TenantId, key_id: &KeyId, envelope: &BarrierEnvelope) -> Result<Vec<u8>, KeystoreError> {
        let aad = format!("{tenant_id}:{key_id}");
        Ok(self.barrier.decrypt(envelope, aad.as_bytes())?)
    }

    fn encode_wrapped(envelope: &BarrierEnvelope) -> String {
        let mut blob = envelope.generation.to_be_bytes().to_vec();
        blob.extend_from_slice(&envelope.nonce);
        blob.extend_from_slice(&envelope.ciphertext);
        hex::encode(blob)
    }

    fn decode_wrapped(content_key_id: &str, hex_blob: &str) -> Result<BarrierEnvelope, KeystoreError> {
        let blob = hex::decode(hex_blob)
            .map_err(|e| KeystoreError::IntegrityViolation(format!("decode wrapped secret: {e}")))?;
        if blob.len() < 8 + 12 {
            return Err(KeystoreError::IntegrityViolation("wrapped secret too short".into()));
        }
        let (generation_bytes, rest) = blob.split_at(8);
        let (nonce_bytes, ciphertext) = rest.split_at(12);
        let mut generation = [0u8; 8];
        generation.copy_from_slice(generation_bytes);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(nonce_bytes);
        Ok(BarrierEnvelope {
            content_key_id: content_key_id.to_string(),
            generation: u64::from_be_bytes(generation),
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    // -----------------------------------------------------------------------
    // Key generation
    // -----------------------------------------------------------------------

    /// Generate a new key, returning its ID. `pool_name` groups this key
    /// with its rotation siblings within the tenant's elastic key pool.
    /// `name` must be unique within `tenant_id` — checked here, before any
    /// row is written, so two concurrent `CreatePool(name=X)` calls can't
    /// both succeed.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate(
        &self,
        tenant_id: &TenantId,
        name: impl Into<String>,
        description: impl Into<String>,
        pool_name: impl Into<String>,
        key_type: KeyType,
        algorithm: AlgorithmFamily,
        provider: KeyProvider,
        versioning_allowed: bool,
        import_allowed: bool,
        policy_id: Option<PolicyId>,
        parent_id: Option<KeyId>,
    ) -> Result<KeyId, GenerateError> {
        let name = name.into();
        let existing = self.repo.list(tenant_id.as_str()).await
            .map_err(|e| GenerateError(KeystoreError::from(e)))?;
        if existing.iter().any(|r| r.value.name == name) {
            return Err(GenerateError(KeystoreError::DuplicateName {
                tenant_id: tenant_id.as_str().to_string(),
                name,
            }));
        }
        if provider != KeyProvider::Internal {
            return Err(GenerateError(KeystoreError::PolicyViolation(format!(
                "provider {provider} material cannot be generated by this keystore; only Internal is"
            ))));
        }

        let id = KeyId::generate();
        let now = Utc::now();

        let content_id = Self::content_key_id(tenant_id, &id, 1);
        let version = self.new_version(tenant_id, &id, &content_id, 1, now, algorithm)
            .await
            .map_err(GenerateError::from)?;

        let meta = KeyMetadata {
            tenant_id: tenant_id.clone(),
            id: id.clone(),
            name,
            description: description.into(),
            pool_name: pool_name.into(),
            provider,
            key_type,
            algorithm,
            state: KeyState::Pending,
            policy_id,
            parent_id,
            versioning_allowed,
            import_allowed,
            export_allowed: false,
            created_at: now,
            updated_at: now,
            activated_at: None,
            rotated_at: None,
            revoked_at: None,
            destroyed_at: None,
            versions: vec![version],
            current_version: 1,
            usage_count: 0,
            tags: HashMap::new(),
            pool_disabled: false,
        };

        self.repo.create(tenant_id.as_str(), id.as_str(), &meta).await
            .map_err(|e| GenerateError(e.into()))?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, &id, key_type, KeyState::Pending, AuditAction::KeyGenerated,
        ));

        Ok(id)
    }

    /// Produce a version's key material for `algorithm`. AES/HMAC keys
    /// never leave the barrier: the content key itself is the secret and
    /// only its id is recorded. Asymmetric families generate a keypair
    /// whose secret half is wrapped under that same content key before
    /// being handed to storage.
    async fn new_version(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
        content_id: &str,
        version: u32,
        created_at: chrono::DateTime<Utc>,
        algorithm: AlgorithmFamily,
    ) -> Result<KeyVersion, KeystoreError> {
        match algorithm {
            AlgorithmFamily::Aes | AlgorithmFamily::Hmac => {
                self.ensure_content_key(tenant_id, content_id)?;
                Ok(KeyVersion {
                    version,
                    created_at,
                    public_key_hex: String::new(),
                    secret_key_hex: String::new(),
                    content_key_id: content_id.to_string(),
                    revoked: false,
                })
            }
            AlgorithmFamily::Rsa => {
                // Draw from the pre-warmed pool instead of generating inline —
                // RSA keygen is the slow part of this path.
                let sk = match self.rsa_pool.get().await {
                    Ok(lease) => lease.into_inner(),
                    Err(_) => generate_rsa_key(),
                };
                let pk = RsaPublicKey::from(&sk);
                let sk_der = sk.to_pkcs1_der()
                    .map_err(|e| KeystoreError::EnvelopeError(format!("rsa encode: {e}")))?;
                let pk_der = pk.to_pkcs1_der()
                    .map_err(|e| KeystoreError::EnvelopeError(format!("rsa encode: {e}")))?;
                let envelope = self.wrap_bytes(tenant_id, key_id, content_id, sk_der.as_bytes())?;
                Ok(KeyVersion {
                    version,
                    created_at,
                    public_key_hex: hex::encode(pk_der.as_bytes()),
                    secret_key_hex: Self::encode_wrapped(&envelope),
                    content_key_id: content_id.to_string(),
                    revoked: false,
                })
            }
            AlgorithmFamily::Ec => {
                let secret = p256::SecretKey::random(&mut rand_core::OsRng);
                let public = secret.public_key();
                let envelope = self.wrap_bytes(tenant_id, key_id, content_id, secret.to_bytes().as_slice())?;
                Ok(KeyVersion {
                    version,
                    created_at,
                    public_key_hex: hex::encode(public.to_encoded_point(true).as_bytes()),
                    secret_key_hex: Self::encode_wrapped(&envelope),
                    content_key_id: content_id.to_string(),
                    revoked: false,
                })
            }
            AlgorithmFamily::EdDsa => {
                let sk = Ed25519SigningKey::generate(&mut rand_core::OsRng);
                let pk = sk.verifying_key();
                let envelope = self.wrap_bytes(tenant_id, key_id, content_id, sk.to_bytes().as_slice())?;
                Ok(KeyVersion {
                    version,
                    created_at,
                    public_key_hex: hex::encode(pk.to_bytes()),
                    secret_key_hex: Self::encode_wrapped(&envelope),
                    content_key_id: content_id.to_string(),
                    revoked: false,
                })
            }
            AlgorithmFamily::Ecdh => {
                let (pk, sk) = self.engine.generate_keypair();
                let envelope = self.wrap_bytes(tenant_id, key_id, content_id, &sk.to_bytes())?;
                Ok(KeyVersion {
                    version,
                    created_at,
                    public_key_hex: hex::encode(pk.to_bytes()),
                    secret_key_hex: Self::encode_wrapped(&envelope),
                    content_key_id: content_id.to_string(),
                    revoked: false,
                })
            }
        }
    }

    /// Unwrap a version's secret half to raw bytes. Callers parse the bytes
    /// into whatever shape their algorithm family expects (DER for RSA, a
    /// raw 32-byte scalar for EC/EdDSA/ECDH).
    fn unwrap_secret_bytes(&self, tenant_id: &TenantId, key_id: &KeyId, version: &KeyVersion) -> Result<Vec<u8>, KeystoreError> {
        let envelope = Self::decode_wrapped(&version.content_key_id, &version.secret_key_hex)?;
        self.unwrap_bytes(tenant_id, key_id, &envelope)
    }

    fn unwrap_secret(&self, tenant_id: &TenantId, key_id: &KeyId, version: &KeyVersion) -> Result<SecretKey, KeystoreError> {
        let bytes = self.unwrap_secret_bytes(tenant_id, key_id, version)?;
        SecretKey::from_bytes(&bytes)
            .map_err(|_| KeystoreError::IntegrityViolation("malformed unwrapped secret key".into()))
    }

    // -----------------------------------------------------------------------
    // Key retrieval
    // -----------------------------------------------------------------------

    /// Get key metadata.
    pub async fn get(&self, tenant_id: &TenantId, id: &KeyId) -> Result<KeyMetadata, KeystoreError> {
        self.repo.get(tenant_id.as_str(), id.as_str()).await
            .map(|r| r.value)
            .map_err(|_| KeystoreError::KeyNotFound(id.clone()))
    }

    /// List all keys for a tenant.
    pub async fn list_keys(&self, tenant_id: &TenantId) -> Result<Vec<KeyMetadata>, KeystoreError> {
        Ok(self.repo.list(tenant_id.as_str()).await?.into_iter().map(|r| r.value).collect())
    }

    /// List a tenant's keys in a specific state.
    pub async fn list_by_state(&self, tenant_id: &TenantId, state: KeyState) -> Result<Vec<KeyMetadata>, KeystoreError> {
        Ok(self.list_keys(tenant_id).await?.into_iter().filter(|k| k.state == state).collect())
    }

    /// List a tenant's keys belonging to one elastic pool.
    pub async fn list_by_pool(&self, tenant_id: &TenantId, pool_name: &str) -> Result<Vec<KeyMetadata>, KeystoreError> {
        Ok(self.list_keys(tenant_id).await?.into_iter().filter(|k| k.pool_name == pool_name).collect())
    }

    async fn put(&self, meta: &KeyMetadata) -> Result<(), KeystoreError> {
        let current = self.repo.get(meta.tenant_id.as_str(), meta.id.as_str()).await?;
        self.repo.update(meta.tenant_id.as_str(), meta.id.as_str(), current.version, meta).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Activate a PENDING key.
    pub async fn activate(&self, tenant_id: &TenantId, id: &KeyId) -> Result<(), LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;
        self.transition(&mut meta, KeyState::Active)?;
        meta.activated_at = Some(Utc::now());
        self.put(&meta).await.map_err(LifecycleError)?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, meta.state, AuditAction::KeyActivated,
        ));
        Ok(())
    }

    /// `UpdatePool`: metadata-only update. Never touches `algorithm`,
    /// `key_type`, or `name` — those are immutable after creation.
    pub async fn update_metadata(
        &self,
        tenant_id: &TenantId,
        id: &KeyId,
        policy_id: Option<PolicyId>,
        tags: Option<HashMap<String, String>>,
    ) -> Result<KeyMetadata, LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;
        if let Some(policy_id) = policy_id {
            meta.policy_id = Some(policy_id);
        }
        if let Some(tags) = tags {
            meta.tags = tags;
        }
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(LifecycleError)?;
        Ok(meta)
    }

    /// `DisablePool`: blocks future `AddMaterial` without touching the
    /// lifecycle state of material already issued — distinct from `revoke`,
    /// which invalidates encrypt/sign for the whole key immediately.
    pub async fn disable_pool(&self, tenant_id: &TenantId, id: &KeyId) -> Result<(), LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;
        meta.pool_disabled = true;
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(LifecycleError)?;
        Ok(())
    }

    /// Rotate an ACTIVE key: generates a new version, moves old to ROTATED
    /// then immediately re-activates with the new version. Blocked if the
    /// pool's `versioning_allowed` flag has been turned off.
    pub async fn rotate(&self, tenant_id: &TenantId, id: &KeyId) -> Result<KeyId, RotateError> {
        let meta = self.get(tenant_id, id).await.map_err(RotateError)?;

        if meta.state != KeyState::Active {
            return Err(RotateError(KeystoreError::NotActive(id.clone())));
        }
        if !meta.versioning_allowed {
            return Err(RotateError(KeystoreError::VersioningDisabled(id.clone())));
        }
        if meta.pool_disabled {
            return Err(RotateError(KeystoreError::OperationNotPermitted { id: id.clone(), operation: "add_material (pool disabled)" }));
        }

        let new_version_num = meta.current_version + 1;
        let now = Utc::now();
        let content_id = Self::content_key_id(tenant_id, id, new_version_num);
        let new_version = self.new_version(tenant_id, id, &content_id, new_version_num, now, meta.algorithm)
            .await
            .map_err(RotateError)?;

        let mut rotated = meta.clone();
        rotated.state = KeyState::Rotated;
        rotated.rotated_at = Some(now);
        rotated.updated_at = now;
        rotated.versions.push(new_version);
        rotated.current_version = new_version_num;

        // The same KeyId keeps its version history; re-activate immediately
        // so the caller doesn't have to call activate() again. These are two
        // writes to the same row — run them as one transactional scope so a
        // crash between them can't strand the key in the intermediate
        // ROTATED state.
        let mut activated = rotated.clone();
        activated.state = KeyState::Active;
        activated.activated_at = Some(now);
        activated.rotated_at = None;
        activated.updated_at = now;

        let current = self.repo.get(tenant_id.as_str(), id.as_str()).await
            .map_err(|e| RotateError(e.into()))?;
        let repo = &self.repo;
        let tenant_str = tenant_id.as_str().to_string();
        let id_str = id.as_str().to_string();
        let expected_version = current.version;
        let scope = kms_repository::TxScope::new();
        repo.with_tx(&scope, Box::new(move || -> kms_repository::BoxFuture<'_, Result<(), kms_repository::RepositoryError>> {
            Box::pin(async move {
                let demoted = repo.update(&tenant_str, &id_str, expected_version, &rotated).await?;
                repo.update(&tenant_str, &id_str, demoted.version, &activated).await?;
                Ok(())
            })
        }))
            .await
            .map_err(|e| RotateError(e.into()))?;

        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, KeyState::Active,
            AuditAction::KeyRotated { new_version: new_version_num },
        ));

        Ok(id.clone())
    }

    /// `AddMaterial`'s import path: bring caller-supplied key bytes in as a
    /// new version instead of generating fresh material. Requires
    /// `import_allowed` and `versioning_allowed`; rejected for ECDH since a
    /// hybrid KEM keypair can't be derived back from an arbitrary byte
    /// string. The public half is always derived from `secret_material`,
    /// never taken from the caller, so a mismatched keypair can't be
    /// imported by mistake.
    pub async fn import(&self, tenant_id: &TenantId, id: &KeyId, secret_material: &[u8]) -> Result<u32, RotateError> {
        let mut meta = self.get(tenant_id, id).await.map_err(RotateError)?;

        if !meta.import_allowed {
            return Err(RotateError(KeystoreError::OperationNotPermitted { id: id.clone(), operation: "import" }));
        }
        if !meta.versioning_allowed {
            return Err(RotateError(KeystoreError::VersioningDisabled(id.clone())));
        }
        if meta.pool_disabled {
            return Err(RotateError(KeystoreError::OperationNotPermitted { id: id.clone(), operation: "import (pool disabled)" }));
        }

        let new_version_num = meta.current_version + 1;
        let now = Utc::now();
        let content_id = Self::content_key_id(tenant_id, id, new_version_num);

        let (public_key_hex, secret_key_hex) = match meta.algorithm {
            AlgorithmFamily::Aes | AlgorithmFamily::Hmac => {
                let key = BarrierKey::from_slice(secret_material)
                    .ok_or_else(|| KeystoreError::InvalidMaterial("expected a 32-byte key".into()))?;
                let inter_id = Self::tenant_intermediate_id(tenant_id);
                {
                    let mut created = self.tenant_intermediates.lock().expect("lock poisoned");
                    if !created.contains(&inter_id) {
                        self.barrier.create_intermediate(&inter_id).map_err(KeystoreError::from)?;
                        created.insert(inter_id.clone());
                    }
                }
                self.barrier.import_content_key(&inter_id, &content_id, key).map_err(KeystoreError::from)?;
                (String::new(), String::new())
            }
            AlgorithmFamily::Rsa => {
                let sk = RsaPrivateKey::from_pkcs1_der(secret_material)
                    .map_err(|e| KeystoreError::InvalidMaterial(format!("rsa private key: {e}")))?;
                let pk = RsaPublicKey::from(&sk);
                let pk_der = pk.to_pkcs1_der()
                    .map_err(|e| KeystoreError::EnvelopeError(format!("rsa encode: {e}")))?;
                let envelope = self.wrap_bytes(tenant_id, id, &content_id, secret_material)?;
                (hex::encode(pk_der.as_bytes()), Self::encode_wrapped(&envelope))
            }
            AlgorithmFamily::Ec => {
                let secret = p256::SecretKey::from_slice(secret_material)
                    .map_err(|e| KeystoreError::InvalidMaterial(format!("ec private key: {e}")))?;
                let public = secret.public_key();
                let envelope = self.wrap_bytes(tenant_id, id, &content_id, secret_material)?;
                (hex::encode(public.to_encoded_point(true).as_bytes()), Self::encode_wrapped(&envelope))
            }
            AlgorithmFamily::EdDsa => {
                let buf: [u8; 32] = secret_material.try_into()
                    .map_err(|_| KeystoreError::InvalidMaterial("expected a 32-byte ed25519 key".into()))?;
                let sk = Ed25519SigningKey::from_bytes(&buf);
                let pk = sk.verifying_key();
                let envelope = self.wrap_bytes(tenant_id, id, &content_id, &buf)?;
                (hex::encode(pk.to_bytes()), Self::encode_wrapped(&envelope))
            }
            AlgorithmFamily::Ecdh => {
                return Err(RotateError(KeystoreError::OperationNotPermitted {
                    id: id.clone(),
                    operation: "import (ECDH hybrid keypairs are not importable)",
                }));
            }
        };

        let new_version = KeyVersion {
            version: new_version_num,
            created_at: now,
            public_key_hex,
            secret_key_hex,
            content_key_id: content_id,
            revoked: false,
        };

        meta.versions.push(new_version);
        meta.current_version = new_version_num;
        meta.updated_at = now;
        if meta.state == KeyState::Pending {
            meta.state = KeyState::Active;
            meta.activated_at = Some(now);
        }

        self.put(&meta).await.map_err(RotateError)?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, meta.state,
            AuditAction::KeyImported { new_version: new_version_num },
        ));

        Ok(new_version_num)
    }

    /// Admin-level barrier rotation (`POST /admin/api/v1/rotate`): mint a
    /// new generation at `(layer, id)` in the barrier itself, independent
    /// of any single key's version history. Outstanding envelopes at the
    /// old generation stay decryptable; see [`kms_barrier::barrier::Barrier::rotate`].
    pub fn rotate_barrier_layer(&self, layer: BarrierLayer, id: &str) -> Result<(), KeystoreError> {
        self.barrier.rotate(layer, id)?;
        Ok(())
    }

    /// Revoke a key (emergency deactivation).
    pub async fn revoke(&self, tenant_id: &TenantId, id: &KeyId, reason: impl Into<String>) -> Result<(), LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;
        let reason = reason.into();

        if meta.state != KeyState::Active {
            return Err(LifecycleError(KeystoreError::InvalidTransition {
                id: id.clone(),
                from: meta.state,
                to: KeyState::Revoked,
            }));
        }

        meta.state = KeyState::Revoked;
        meta.revoked_at = Some(Utc::now());
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(LifecycleError)?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, meta.state,
            AuditAction::KeyRevoked { reason },
        ));
        Ok(())
    }

    /// `RevokeMaterial`: revoke a single version, distinct from whole-key
    /// `revoke`. A revoked version is skipped by encrypt/sign's
    /// most-recent-non-revoked targeting but stays available to decrypt/
    /// verify per invariant 5.
    pub async fn revoke_material(&self, tenant_id: &TenantId, id: &KeyId, version: u32) -> Result<(), LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;
        let found = meta.versions.iter_mut().find(|v| v.version == version)
            .ok_or_else(|| LifecycleError(KeystoreError::KeyNotFound(id.clone())))?;
        found.revoked = true;
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(LifecycleError)?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, meta.state,
            AuditAction::KeyRevoked { reason: format!("material version {version} revoked") },
        ));
        Ok(())
    }

    /// `GetMaterialPublic`: the public half of asymmetric material, honoring
    /// `export_allowed`. Symmetric families (AES/HMAC) have no public half
    /// and are rejected outright.
    pub async fn get_material_public(&self, tenant_id: &TenantId, id: &KeyId, version: u32) -> Result<String, KeystoreError> {
        let meta = self.get(tenant_id, id).await?;
        if !meta.export_allowed {
            return Err(KeystoreError::OperationNotPermitted { id: id.clone(), operation: "export" });
        }
        if matches!(meta.algorithm, AlgorithmFamily::Aes | AlgorithmFamily::Hmac) {
            return Err(KeystoreError::OperationNotPermitted { id: id.clone(), operation: "export (symmetric family has no public half)" });
        }
        let v = meta.version(version).ok_or_else(|| KeystoreError::KeyNotFound(id.clone()))?;
        Ok(v.public_key_hex.clone())
    }

    /// Expire a key (ROTATED past grace period, or ACTIVE past max_lifetime).
    pub async fn expire(&self, tenant_id: &TenantId, id: &KeyId) -> Result<ExpirationSource, ExpireError> {
        let mut meta = self.get(tenant_id, id).await.map_err(ExpireError)?;
        let decision = self.check_expiration(&meta);

        match decision {
            ExpirationDecision::Required { reason, source } => {
                meta.state = KeyState::Expired;
                meta.updated_at = Utc::now();
                self.put(&meta).await.map_err(ExpireError)?;
                self.audit.record(AuditEvent::key_event(
                    tenant_id, id, meta.key_type, meta.state,
                    AuditAction::KeyExpired { reason },
                ));
                Ok(source)
            }
            _ => Err(ExpireError(KeystoreError::InvalidTransition {
                id: id.clone(),
                from: meta.state,
                to: KeyState::Expired,
            })),
        }
    }

    /// Destroy a key (purge material). Only EXPIRED or REVOKED keys can be destroyed.
    pub async fn destroy(&self, tenant_id: &TenantId, id: &KeyId) -> Result<(), LifecycleError> {
        let mut meta = self.get(tenant_id, id).await.map_err(LifecycleError)?;

        if !meta.state.can_transition_to(KeyState::Destroyed) {
            return Err(LifecycleError(KeystoreError::InvalidTransition {
                id: id.clone(),
                from: meta.state,
                to: KeyState::Destroyed,
            }));
        }

        for version in &meta.versions {
            self.barrier.evict(BarrierLayer::Content, &version.content_key_id);
        }
        for version in &mut meta.versions {
            version.public_key_hex = String::from("DESTROYED");
            version.secret_key_hex = String::from("DESTROYED");
        }

        meta.state = KeyState::Destroyed;
        meta.destroyed_at = Some(Utc::now());
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(LifecycleError)?;
        self.audit.record(AuditEvent::key_event(
            tenant_id, id, meta.key_type, meta.state, AuditAction::KeyDestroyed,
        ));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expiration checks
    // -----------------------------------------------------------------------

    /// Check if a specific key should expire.
    pub async fn should_expire(&self, tenant_id: &TenantId, id: &KeyId) -> Result<ExpirationDecision, KeystoreError> {
        let meta = self.get(tenant_id, id).await?;
        Ok(self.check_expiration(&meta))
    }

    /// Internal expiration check logic.
    fn check_expiration(&self, meta: &KeyMetadata) -> ExpirationDecision {
        match meta.state {
            // ROTATED keys: check grace period
            KeyState::Rotated => {
                if let Some(rotated_at) = meta.rotated_at {
                    let grace = self.grace_period_for(meta);
                    let elapsed = Utc::now() - rotated_at;
                    let grace_chrono = chrono::Duration::from_std(grace)
                        .unwrap_or(chrono::Duration::MAX);

                    if elapsed >= grace_chrono {
                        return ExpirationDecision::Required {
                            reason: format!("rotated {}s ago, grace period {}s",
                                elapsed.num_seconds(), grace.as_secs()),
                            source: ExpirationSource::GracePeriodExpired,
                        };
                    }

                    // Warn at 90%
                    let warn_secs = (grace.as_secs() as f64 * 0.9) as i64;
                    if elapsed.num_seconds() >= warn_secs {
                        let remaining = grace_chrono - elapsed;
                        return ExpirationDecision::Warning {
                            reason: "grace period expiring soon".to_string(),
                            remaining: remaining.to_std().unwrap_or(Duration::ZERO),
                            source: ExpirationSource::GracePeriodExpired,
                        };
                    }
                }
                ExpirationDecision::NotNeeded
            }

            // ACTIVE keys: check max_lifetime
            KeyState::Active => {
                if let Some(max_lifetime) = self.max_lifetime_for(meta) {
                    if let Some(activated_at) = meta.activated_at {
                        let elapsed = Utc::now() - activated_at;
                        let max_chrono = chrono::Duration::from_std(max_lifetime)
                            .unwrap_or(chrono::Duration::MAX);

                        if elapsed >= max_chrono {
                            return ExpirationDecision::Required {
                                reason: format!("active for {}s, max lifetime {}s",
                                    elapsed.num_seconds(), max_lifetime.as_secs()),
                                source: ExpirationSource::MaxLifetimeExceeded,
                            };
                        }

                        // Warn at 90%
                        let warn_secs = (max_lifetime.as_secs() as f64 * 0.9) as i64;
                        if elapsed.num_seconds() >= warn_secs {
                            let remaining = max_chrono - elapsed;
                            return ExpirationDecision::Warning {
                                reason: "max lifetime expiring soon".to_string(),
                                remaining: remaining.to_std().unwrap_or(Duration::ZERO),
                                source: ExpirationSource::MaxLifetimeExceeded,
                            };
                        }
                    }
                }
                ExpirationDecision::NotNeeded
            }

            _ => ExpirationDecision::NotNeeded,
        }
    }

    /// Process all of a tenant's keys that need expiration (bulk operation).
    pub async fn expire_due_keys(&self, tenant_id: &TenantId) -> Result<ExpirationReport, KeystoreError> {
        let mut report = ExpirationReport::default();

        let rotated = self.list_by_state(tenant_id, KeyState::Rotated).await?;
        let active = self.list_by_state(tenant_id, KeyState::Active).await?;

        for meta in rotated.iter().chain(active.iter()) {
            match self.check_expiration(meta) {
                ExpirationDecision::Required { .. } => {
                    match self.expire(tenant_id, &meta.id).await {
                        Ok(src) => report.expired.push((meta.id.clone(), src)),
                        Err(e) => report.failed.push((meta.id.clone(), e.to_string())),
                    }
                }
                ExpirationDecision::Warning { reason, remaining, .. } => {
                    report.warnings.push((meta.id.clone(), reason, remaining));
                }
                ExpirationDecision::NotNeeded => {
                    report.skipped += 1;
                }
            }
        }

        self.audit.record(AuditEvent::tenant_event(
            tenant_id,
            AuditAction::ExpirationCheckRun {
                expired_count: report.expired.len(),
                warning_count: report.warnings.len(),
            },
        ));

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Policy evaluation
    // -----------------------------------------------------------------------

    /// Evaluate policy for a key.
    pub async fn evaluate_policy(&self, tenant_id: &TenantId, id: &KeyId) -> Result<policy::PolicyVerdict, KeystoreError> {
        let meta = self.get(tenant_id, id).await?;
        let policy = match &meta.policy_id {
            Some(pid) => self.policies.get(pid.as_str())
                .ok_or_else(|| KeystoreError::PolicyNotFound(pid.as_str().to_string()))?,
            None => return Ok(policy::PolicyVerdict::Compliant),
        };

        let verdict = policy::evaluate(policy, &meta);
        self.audit.record(
            AuditEvent::key_event(
                tenant_id, id, meta.key_type, meta.state,
                AuditAction::PolicyEvaluated { verdict: format!("{:?}", verdict) },
            ),
        );
        Ok(verdict)
    }

    /// Check all of a tenant's keys and return those needing rotation.
    pub async fn check_rotation_due(&self, tenant_id: &TenantId) -> Result<Vec<(KeyId, String)>, KeystoreError> {
        let active = self.list_by_state(tenant_id, KeyState::Active).await?;
        let mut due = Vec::new();

        for meta in active {
            if let Some(pid) = &meta.policy_id {
                if let Some(policy) = self.policies.get(pid.as_str()) {
                    let verdict = policy::evaluate(policy, &meta);
                    if let policy::PolicyVerdict::RotationNeeded { reason } = verdict {
                        due.push((meta.id.clone(), reason));
                    }
                }
            }
        }
        Ok(due)
    }

    // -----------------------------------------------------------------------
    // Convenience encrypt/decrypt (C6 — dispatches on algorithm family)
    // -----------------------------------------------------------------------

    /// Draw fresh entropy straight from the OS CSPRNG. Unlike every other
    /// C6 operation, this never touches stored key material or the barrier —
    /// there is no "random" key to look up, wrap, or audit against a
    /// tenant/pool, so this bypasses the repository entirely.
    pub fn generate_random(&self, num_bytes: usize) -> Vec<u8> {
        use rand_core::RngCore;
        let mut buf = vec![0u8; num_bytes];
        rand_core::OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Encrypt data using the current active version of a key.
    ///
    /// **Enforcement gates**, in order: the key's algorithm family must
    /// permit `encrypt`; the key must be in a state that allows it; and
    /// the key must pass its threat-adapted policy (`RotationNeeded` /
    /// `UsageLimitExceeded` block the call outright — rotate first).
    /// `Warning` verdicts are logged but allowed through.
    pub async fn encrypt(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<EncryptedBlob, EncryptError> {
        let mut meta = self.get(tenant_id, key_id).await
            .map_err(|e| EncryptError(e.to_string()))?;

        if !meta.algorithm.permitted_operations().encrypt {
            return Err(EncryptError(format!("{} keys do not permit encrypt", meta.algorithm)));
        }
        if !meta.state.can_encrypt() {
            return Err(EncryptError(format!("key {} is {}, cannot encrypt", key_id, meta.state)));
        }

        if let Some(adapted) = self.effective_policy_for(&meta) {
            let verdict = policy::evaluate(&adapted, &meta);
            match &verdict {
                policy::PolicyVerdict::RotationNeeded { reason } => {
                    self.audit.record(AuditEvent::key_event(
                        tenant_id, key_id, meta.key_type, meta.state,
                        AuditAction::PolicyEvaluated { verdict: format!("BLOCKED: {}", reason) },
                    ));
                    return Err(EncryptError(format!(
                        "policy violation: {}. Rotate key before encrypting.", reason
                    )));
                }
                policy::PolicyVerdict::UsageLimitExceeded { count, limit } => {
                    self.audit.record(AuditEvent::key_event(
                        tenant_id, key_id, meta.key_type, meta.state,
                        AuditAction::PolicyEvaluated { verdict: format!("BLOCKED: usage {}/{}", count, limit) },
                    ));
                    return Err(EncryptError(format!(
                        "policy violation: usage {}/{} exceeded. Rotate key before encrypting.",
                        count, limit
                    )));
                }
                policy::PolicyVerdict::Warning { reason } => {
                    self.audit.record(AuditEvent::key_event(
                        tenant_id, key_id, meta.key_type, meta.state,
                        AuditAction::PolicyEvaluated { verdict: format!("WARNING: {}", reason) },
                    ));
                }
                policy::PolicyVerdict::Compliant => {}
            }
        }

        let version = meta.current_key_version()
            .ok_or_else(|| EncryptError("no current version".into()))?
            .clone();
        if version.revoked {
            return Err(EncryptError(format!("key {} version {} was revoked (RevokeMaterial)", key_id, version.version)));
        }

        let (ciphertext, nonce_hex) = match meta.algorithm {
            AlgorithmFamily::Aes | AlgorithmFamily::Hmac => {
                let envelope = self.wrap_bytes(tenant_id, key_id, &version.content_key_id, plaintext)
                    .map_err(|e| EncryptError(e.to_string()))?;
                (envelope.ciphertext, hex::encode(envelope.nonce))
            }
            AlgorithmFamily::Rsa => {
                let pk_der = hex::decode(&version.public_key_hex)
                    .map_err(|e| EncryptError(format!("decode pk: {}", e)))?;
                let pk = RsaPublicKey::from_pkcs1_der(&pk_der)
                    .map_err(|e| EncryptError(format!("parse rsa public key: {e}")))?;
                let padding = Oaep::new_with_label::<Sha256, _>(hex::encode(aad));
                let ct = pk.encrypt(&mut rand_core::OsRng, padding, plaintext)
                    .map_err(|e| EncryptError(format!("rsa-oaep encrypt: {e}")))?;
                (ct, String::new())
            }
            other => return Err(EncryptError(format!("{other} keys do not permit encrypt"))),
        };

        meta.usage_count += 1;
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(|e| EncryptError(e.to_string()))?;

        self.audit.record(AuditEvent::key_event(
            tenant_id, key_id, meta.key_type, meta.state,
            AuditAction::EncryptionPerformed { key_version: meta.current_version },
        ));

        Ok(EncryptedBlob {
            key_id: key_id.as_str().to_string(),
            key_version: meta.current_version,
            ciphertext_hex: hex::encode(&ciphertext),
            nonce_hex,
            encrypted_at: Utc::now(),
        })
    }

    /// Decrypt an `EncryptedBlob`.
    pub async fn decrypt(
        &self,
        tenant_id: &TenantId,
        blob: &EncryptedBlob,
        aad: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        let key_id = KeyId::new(&blob.key_id);
        let meta = self.get(tenant_id, &key_id).await
            .map_err(|e| DecryptError(e.to_string()))?;

        if !meta.algorithm.permitted_operations().decrypt {
            return Err(DecryptError(format!("{} keys do not permit decrypt", meta.algorithm)));
        }
        if !meta.state.can_decrypt() {
            return Err(DecryptError(format!("key {} is {}, cannot decrypt", key_id, meta.state)));
        }

        let version = meta.versions.iter()
            .find(|v| v.version == blob.key_version)
            .ok_or_else(|| DecryptError(format!("version {} not found", blob.key_version)))?;

        let ciphertext = hex::decode(&blob.ciphertext_hex)
            .map_err(|e| DecryptError(format!("decode ct: {}", e)))?;

        let plaintext_result: Result<Vec<u8>, String> = match meta.algorithm {
            AlgorithmFamily::Aes | AlgorithmFamily::Hmac => {
                let nonce_bytes = hex::decode(&blob.nonce_hex)
                    .map_err(|e| format!("decode nonce: {}", e))?;
                if nonce_bytes.len() != 12 {
                    return Err(DecryptError("malformed nonce".into()));
                }
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&nonce_bytes);
                let envelope = BarrierEnvelope {
                    content_key_id: version.content_key_id.clone(),
                    // Content keys are minted per-KeyVersion and never
                    // rotated through the barrier directly, so generation
                    // is always 0 for this flow.
                    generation: 0,
                    nonce,
                    ciphertext,
                };
                self.unwrap_bytes(tenant_id, &key_id, &envelope).map_err(|e| e.to_string())
            }
            AlgorithmFamily::Rsa => {
                let sk_der = self.unwrap_secret_bytes(tenant_id, &key_id, version)
                    .map_err(|e| e.to_string())?;
                let sk = RsaPrivateKey::from_pkcs1_der(&sk_der)
                    .map_err(|e| format!("parse rsa private key: {e}"))?;
                let padding = Oaep::new_with_label::<Sha256, _>(hex::encode(aad));
                sk.decrypt(padding, &ciphertext)
                    .map_err(|_| "decryption failed".to_string())
            }
            other => Err(format!("{other} keys do not permit decrypt")),
        };

        let plaintext = match plaintext_result {
            Ok(pt) => pt,
            Err(_) => {
                self.record_threat_event(ThreatEvent::new(
                    ThreatEventKind::DecryptionFailure, 3.0,
                ).with_detail(format!("key={}, version={}", blob.key_id, blob.key_version)));

                self.audit.record(AuditEvent::key_event(
                    tenant_id, &key_id, meta.key_type, meta.state,
                    AuditAction::DecryptionFailed { key_version: blob.key_version },
                ));

                return Err(DecryptError("decryption failed".into()));
            }
        };

        self.audit.record(AuditEvent::key_event(
            tenant_id, &key_id, meta.key_type, meta.state,
            AuditAction::DecryptionPerformed { key_version: blob.key_version },
        ));

        Ok(plaintext)
    }

    /// Sign `message` with the key's current version.
    ///
    /// HMAC treats "sign" as a MAC over the unwrapped content key. RSA uses
    /// RSA-PSS over SHA-256, EC uses ECDSA over P-256, EdDSA uses Ed25519 —
    /// each unwraps its raw secret bytes via `unwrap_secret_bytes` and parses
    /// them into the shape `new_version` stored them as.
    pub async fn sign(&self, tenant_id: &TenantId, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SignError> {
        let mut meta = self.get(tenant_id, key_id).await
            .map_err(|e| SignError(e.to_string()))?;

        if !meta.algorithm.permitted_operations().sign {
            return Err(SignError(format!("{} keys do not permit sign", meta.algorithm)));
        }
        if !meta.state.can_encrypt() {
            return Err(SignError(format!("key {} is {}, cannot sign", key_id, meta.state)));
        }

        let version = meta.current_key_version()
            .ok_or_else(|| SignError("no current version".into()))?
            .clone();
        if version.revoked {
            return Err(SignError(format!("key {} version {} was revoked (RevokeMaterial)", key_id, version.version)));
        }

        let signature = match meta.algorithm {
            AlgorithmFamily::Hmac => self.barrier.mac(&version.content_key_id, message)
                .map_err(|e| SignError(e.to_string()))?,
            AlgorithmFamily::Rsa => {
                let sk_der = self.unwrap_secret_bytes(tenant_id, key_id, &version)
                    .map_err(|e| SignError(e.to_string()))?;
                let sk = RsaPrivateKey::from_pkcs1_der(&sk_der)
                    .map_err(|e| SignError(format!("parse rsa private key: {e}")))?;
                let signing_key = RsaSigningKey::<Sha256>::new(sk);
                signing_key.sign_with_rng(&mut rand_core::OsRng, message).to_vec()
            }
            AlgorithmFamily::Ec => {
                let sk_bytes = self.unwrap_secret_bytes(tenant_id, key_id, &version)
                    .map_err(|e| SignError(e.to_string()))?;
                let secret = p256::SecretKey::from_slice(&sk_bytes)
                    .map_err(|e| SignError(format!("parse ec private key: {e}")))?;
                let signing_key = p256::ecdsa::SigningKey::from(secret);
                let sig: p256::ecdsa::Signature = signing_key.sign(message);
                sig.to_bytes().to_vec()
            }
            AlgorithmFamily::EdDsa => {
                let sk_bytes = self.unwrap_secret_bytes(tenant_id, key_id, &version)
                    .map_err(|e| SignError(e.to_string()))?;
                let buf: [u8; 32] = sk_bytes.as_slice().try_into()
                    .map_err(|_| SignError("malformed ed25519 private key".into()))?;
                let signing_key = Ed25519SigningKey::from_bytes(&buf);
                signing_key.sign(message).to_bytes().to_vec()
            }
            other => return Err(SignError(format!("{other} keys do not permit sign"))),
        };

        meta.usage_count += 1;
        meta.updated_at = Utc::now();
        self.put(&meta).await.map_err(|e| SignError(e.to_string()))?;

        self.audit.record(AuditEvent::key_event(
            tenant_id, key_id, meta.key_type, meta.state,
            AuditAction::SignaturePerformed { key_version: meta.current_version },
        ));

        Ok(signature)
    }

    /// Verify a signature produced by [`Keystore::sign`]. Revoked material
    /// remains verifiable (invariant: revoke blocks encrypt/sign, not
    /// decrypt/verify). A malformed signature (wrong length, bad encoding)
    /// is treated as `valid = false`, not an error — only a key that
    /// cannot verify at all (wrong state, wrong permission) is an error.
    pub async fn verify(
        &self,
        tenant_id: &TenantId,
        key_id: &KeyId,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, VerifyError> {
        let meta = self.get(tenant_id, key_id).await
            .map_err(|e| VerifyError(e.to_string()))?;

        if !meta.algorithm.permitted_operations().verify {
            return Err(VerifyError(format!("{} keys do not permit verify", meta.algorithm)));
        }
        if !meta.state.can_decrypt() {
            return Err(VerifyError(format!("key {} is {}, cannot verify", key_id, meta.state)));
        }

        let version = meta.current_key_version()
            .ok_or_else(|| VerifyError("no current version".into()))?;

        let valid = match meta.algorithm {
            AlgorithmFamily::Hmac => self.barrier.mac_verify(&version.content_key_id, message, signature)
                .map_err(|e| VerifyError(e.to_string()))?,
            AlgorithmFamily::Rsa => {
                let pk_der = hex::decode(&version.public_key_hex)
                    .map_err(|e| VerifyError(format!("decode pk: {e}")))?;
                let pk = RsaPublicKey::from_pkcs1_der(&pk_der)
                    .map_err(|e| VerifyError(format!("parse rsa public key: {e}")))?;
                let verifying_key = RsaVerifyingKey::<Sha256>::new(pk);
                match rsa::pss::Signature::try_from(signature) {
                    Ok(sig) => verifying_key.verify(message, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            AlgorithmFamily::Ec => {
                let pk_bytes = hex::decode(&version.public_key_hex)
                    .map_err(|e| VerifyError(format!("decode pk: {e}")))?;
                match p256::PublicKey::from_sec1_bytes(&pk_bytes) {
                    Ok(public) => {
                        let verifying_key = p256::ecdsa::VerifyingKey::from(&public);
                        match p256::ecdsa::Signature::from_slice(signature) {
                            Ok(sig) => verifying_key.verify(message, &sig).is_ok(),
                            Err(_) => false,
                        }
                    }
                    Err(_) => false,
                }
            }
            AlgorithmFamily::EdDsa => {
                let pk_bytes = hex::decode(&version.public_key_hex)
                    .map_err(|e| VerifyError(format!("decode pk: {e}")))?;
                match <&[u8; 32]>::try_from(pk_bytes.as_slice())
                    .ok()
                    .and_then(|buf| Ed25519VerifyingKey::from_bytes(buf).ok())
                {
                    Some(verifying_key) => match Ed25519Signature::from_slice(signature) {
                        Ok(sig) => verifying_key.verify(message, &sig).is_ok(),
                        Err(_) => false,
                    },
                    None => false,
                }
            }
            other => return Err(VerifyError(format!("{other} keys do not permit verify"))),
        };

        self.audit.record(AuditEvent::key_event(
            tenant_id, key_id, meta.key_type, meta.state,
            AuditAction::VerificationPerformed { key_version: meta.current_version, valid },
        ));

        Ok(valid)
    }

    // -----------------------------------------------------------------------
    // Helper methods
    // -----------------------------------------------------------------------

    fn transition(&self, meta: &mut KeyMetadata, target: KeyState) -> Result<(), LifecycleError> {
        if !meta.state.can_transition_to(target) {
            return Err(LifecycleError(KeystoreError::InvalidTransition {
                id: meta.id.clone(),
                from: meta.state,
                to: target,
            }));
        }
        meta.state = target;
        meta.updated_at = Utc::now();
        Ok(())
    }

    /// Snapshot the current threat level (short lock).
    fn current_threat_level(&self) -> ThreatLevel {
        self.threat.lock().unwrap().current_level()
    }

    /// Get the effective (threat-adapted) policy for a key.
    fn effective_policy_for(&self, meta: &KeyMetadata) -> Option<KeyPolicy> {
        let level = self.current_threat_level();
        meta.policy_id
            .as_ref()
            .and_then(|pid| self.policies.get(pid.as_str()))
            .map(|base| PolicyAdapter::adapt(base, level))
    }

    fn grace_period_for(&self, meta: &KeyMetadata) -> Duration {
        self.effective_policy_for(meta)
            .map(|p| p.rotation_grace_period)
            .unwrap_or(Duration::from_secs(7 * 86400))
    }

    fn max_lifetime_for(&self, meta: &KeyMetadata) -> Option<Duration> {
        self.effective_policy_for(meta)
            .and_then(|p| p.max_lifetime)
    }

    // -----------------------------------------------------------------------
    // Barrier ceremony API
    // -----------------------------------------------------------------------

    /// Submit one unseal share to the underlying barrier.
    pub fn submit_unseal_share(&self, share: Vec<u8>) -> Result<kms_barrier::barrier::UnsealProgress, KeystoreError> {
        let progress = self.barrier.submit_unseal_share(share)?;
        self.audit.record(AuditEvent::system_event(AuditAction::UnsealShareSubmitted {
            have: progress.have,
            need: progress.need,
            unsealed: progress.unsealed,
        }));
        Ok(progress)
    }

    /// Reseal the barrier, zeroizing every unwrapped key this process holds.
    pub fn seal(&self) {
        self.barrier.seal();
        self.tenant_intermediates.lock().expect("lock poisoned").clear();
        self.content_keys.lock().expect("lock poisoned").clear();
        self.audit.record(AuditEvent::system_event(AuditAction::BarrierSealed));
    }

    pub fn is_sealed(&self) -> bool {
        self.barrier.is_sealed()
    }

    // -----------------------------------------------------------------------
    // Threat assessment API
    // -----------------------------------------------------------------------

    /// Record a threat event and recompute the threat level.
    pub fn record_threat_event(&self, event: ThreatEvent) {
        self.threat.lock().unwrap().record_event(event);
    }

    /// Record multiple threat events.
    pub fn record_threat_events(&self, events: Vec<ThreatEvent>) {
        self.threat.lock().unwrap().record_events(events);
    }

    /// Get the current threat level.
    pub fn threat_level(&self) -> ThreatLevel {
        self.current_threat_level()
    }

    /// Get the raw threat score.
    pub fn threat_score(&self) -> f64 {
        self.threat.lock().unwrap().raw_score()
    }

    /// Get comprehensive security metrics for a tenant's dashboard.
    pub async fn security_metrics(&self, tenant_id: &TenantId) -> Result<SecurityMetrics, KeystoreError> {
        let level = self.current_threat_level();
        let all_keys = self.list_keys(tenant_id).await?;
        let total = all_keys.len();
        let mut compliant = 0;

        for meta in &all_keys {
            if let Some(pid) = &meta.policy_id {
                if let Some(base_policy) = self.policies.get(pid.as_str()) {
                    let adapted = PolicyAdapter::adapt(base_policy, level);
                    let verdict = policy::evaluate(&adapted, meta);
                    if matches!(verdict, policy::PolicyVerdict::Compliant | policy::PolicyVerdict::Warning { .. }) {
                        compliant += 1;
                    }
                } else {
                    compliant += 1;
                }
            } else {
                compliant += 1;
            }
        }

        Ok(self.threat.lock().unwrap().security_metrics(total, compliant))
    }

    /// Get threat level transition history (owned copy).
    pub fn threat_history(&self) -> Vec<(chrono::DateTime<Utc>, ThreatLevel, String)> {
        self.threat.lock().unwrap().level_history().to_vec()
    }

    /// Get adaptation summary for a specific policy at the current threat level.
    pub fn policy_adaptation_summary(&self, policy_id: &PolicyId) -> Option<crate::threat::AdaptationSummary> {
        let level = self.current_threat_level();
        self.policies
            .get(policy_id.as_str())
            .map(|base| PolicyAdapter::summarize(base, level))
    }

    /// Evaluate policy using threat-adapted parameters.
    pub async fn evaluate_adaptive_policy(&self, tenant_id: &TenantId, id: &KeyId) -> Result<policy::PolicyVerdict, KeystoreError> {
        let level = self.current_threat_level();
        let meta = self.get(tenant_id, id).await?;
        let adapted_policy = match &meta.policy_id {
            Some(pid) => {
                let base = self.policies.get(pid.as_str())
                    .ok_or_else(|| KeystoreError::PolicyNotFound(pid.as_str().to_string()))?;
                PolicyAdapter::adapt(base, level)
            }
            None => return Ok(policy::PolicyVerdict::Compliant),
        };

        let verdict = policy::evaluate(&adapted_policy, &meta);
        self.audit.record(
            AuditEvent::key_event(
                tenant_id, id, meta.key_type, meta.state,
                AuditAction::PolicyEvaluated {
                    verdict: format!("{:?} (threat:{})", verdict, level.label()),
                },
            ),
        );
        Ok(verdict)
    }

    /// Check all of a tenant's keys using threat-adapted policies and
    /// return those needing rotation.
    pub async fn check_adaptive_rotation_due(&self, tenant_id: &TenantId) -> Result<Vec<(KeyId, String)>, KeystoreError> {
        let level = self.current_threat_level();
        let active = self.list_by_state(tenant_id, KeyState::Active).await?;
        let mut due = Vec::new();

        for meta in active {
            if let Some(pid) = &meta.policy_id {
                if let Some(base_policy) = self.policies.get(pid.as_str()) {
                    let adapted = PolicyAdapter::adapt(base_policy, level);
                    let verdict = policy::evaluate(&adapted, &meta);
                    if let policy::PolicyVerdict::RotationNeeded { reason } = verdict {
                        due.push((meta.id.clone(), format!("{} [threat:{}]", reason, level.label())));
                    }
                }
            }
        }
        Ok(due)
    }
}
