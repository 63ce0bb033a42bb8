//! # KMS Keystore
//!
//! Multi-tenant key lifecycle management on top of a four-layer barrier
//! hierarchy (unseal → root → intermediate → content) and a pluggable
//! [`kms_repository::Repository`] for metadata persistence.
//!
//! Provides an elastic key pool per tenant, policy-driven rotation, audit
//! logging with a tamper-evident hash chain, and threat-adaptive policy
//! tightening.
//!
//! Built on top of `kms-barrier` for hybrid X25519 + ML-KEM-768 encryption
//! and Shamir-quorum unsealing, and `kms-repository` for tenant-scoped CRUD.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kms_core::*;
//! use kms_barrier::barrier::{Barrier, UnsealConfig};
//! use kms_repository::InMemoryRepository;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let (barrier, shares) = Barrier::initialize(UnsealConfig::new(1, 1).unwrap()).unwrap();
//! let barrier = Arc::new(barrier);
//! barrier.submit_unseal_share(shares[0].clone()).unwrap();
//!
//! let repo = Arc::new(InMemoryRepository::new());
//! let audit = Arc::new(InMemoryAuditSink::new());
//! let mut ks = Keystore::new(repo, barrier, audit);
//!
//! ks.register_policy(KeyPolicy::default_dek());
//!
//! let tenant = TenantId::new("acme-corp");
//! let key_id = ks.generate(&tenant, "my-dek", "", "payments", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
//! ks.activate(&tenant, &key_id).await.unwrap();
//!
//! let blob = ks.encrypt(&tenant, &key_id, b"secret data", b"context").await.unwrap();
//! let plaintext = ks.decrypt(&tenant, &blob, b"context").await.unwrap();
//! assert_eq!(plaintext, b"secret data");
//! # });
//! ```

pub mod audit;
pub mod error;
pub mod keystore;
pub mod policy;
pub mod storage;
pub mod threat;
pub mod types;

// Re-export main types for convenience
pub use audit::{AuditEvent, AuditSinkSync, FileAuditSink, InMemoryAuditSink, IntegrityChainSink, TracingAuditSink};
pub use error::{
    DecryptError, DestroyDecision, EncryptError, ErrorKind, ExpirationDecision, ExpirationReport,
    ExpirationSource, ExpireError, GenerateError, KeystoreError, LifecycleError, RotateError,
    SignError, VerifyError,
};
pub use keystore::{EncryptedBlob, Keystore};
pub use policy::{KeyPolicy, PolicyVerdict, RotationTrigger};
pub use storage::{Entity, InMemoryRepository, KeyRepository, PostgresRepository, Record, RepositoryError, SqliteRepository};
pub use threat::{
    AdaptationSummary, PolicyAdapter, SecurityMetrics, ThreatAssessor, ThreatConfig,
    ThreatEvent, ThreatEventKind, ThreatLevel,
};
pub use types::{
    AlgorithmFamily, KeyId, KeyMetadata, KeyProvider, KeyState, KeyType, KeyVersion,
    PermittedOperations, PolicyId, TenantId,
};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kms_barrier::barrier::{Barrier, UnsealConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_tenant() -> TenantId {
        TenantId::new("test-tenant")
    }

    fn test_barrier() -> Arc<Barrier> {
        let (barrier, shares) = Barrier::initialize(UnsealConfig::new(1, 1).unwrap()).unwrap();
        barrier.submit_unseal_share(shares[0].clone()).unwrap();
        Arc::new(barrier)
    }

    fn test_keystore() -> Keystore {
        let repo = Arc::new(InMemoryRepository::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        Keystore::new(repo, test_barrier(), audit)
    }

    fn test_keystore_with_audit() -> (Keystore, Arc<InMemoryAuditSink>) {
        let repo = Arc::new(InMemoryRepository::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let ks = Keystore::new(repo, test_barrier(), audit.clone());
        (ks, audit)
    }

    // === Key Generation ===

    #[tokio::test]
    async fn test_generate_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "test-key", "", "pool-a", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let meta = ks.get(&tenant, &id).await.unwrap();

        assert_eq!(meta.name, "test-key");
        assert_eq!(meta.key_type, KeyType::DataEncrypting);
        assert_eq!(meta.state, KeyState::Pending);
        assert_eq!(meta.current_version, 1);
        assert_eq!(meta.usage_count, 0);
        assert_eq!(meta.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_all_key_types() {
        let ks = test_keystore();
        let tenant = test_tenant();
        for kt in [KeyType::Root, KeyType::Domain, KeyType::KeyEncrypting, KeyType::DataEncrypting] {
            let id = ks.generate(&tenant, format!("{:?}", kt), "", "pool", kt, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
            let meta = ks.get(&tenant, &id).await.unwrap();
            assert_eq!(meta.key_type, kt);
        }
    }

    #[tokio::test]
    async fn test_generate_with_parent() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let parent = ks.generate(&tenant, "parent", "", "pool", KeyType::KeyEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let child = ks.generate(&tenant, "child", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, Some(parent.clone())).await.unwrap();
        let meta = ks.get(&tenant, &child).await.unwrap();
        assert_eq!(meta.parent_id, Some(parent));
    }

    #[tokio::test]
    async fn test_generate_rsa_key_has_public_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "rsa-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Rsa, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let meta = ks.get(&tenant, &id).await.unwrap();
        assert!(!meta.versions[0].public_key_hex.is_empty());
        assert!(!meta.versions[0].secret_key_hex.is_empty());
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let ks = test_keystore();
        let tenant_a = TenantId::new("tenant-a");
        let tenant_b = TenantId::new("tenant-b");
        let id = ks.generate(&tenant_a, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        assert!(ks.get(&tenant_a, &id).await.is_ok());
        assert!(ks.get(&tenant_b, &id).await.is_err());
    }

    // === Activation ===

    #[tokio::test]
    async fn test_activate_pending_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        let meta = ks.get(&tenant, &id).await.unwrap();
        assert_eq!(meta.state, KeyState::Active);
        assert!(meta.activated_at.is_some());
    }

    #[tokio::test]
    async fn test_activate_non_pending_fails() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        let result = ks.activate(&tenant, &id).await;
        assert!(result.is_err());
    }

    // === Rotation ===

    #[tokio::test]
    async fn test_rotate_active_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.rotate(&tenant, &id).await.unwrap();

        let meta = ks.get(&tenant, &id).await.unwrap();
        assert_eq!(meta.state, KeyState::Active);
        assert_eq!(meta.current_version, 2);
        assert_eq!(meta.versions.len(), 2);
    }

    #[tokio::test]
    async fn test_rotate_preserves_old_versions() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.rotate(&tenant, &id).await.unwrap();
        ks.rotate(&tenant, &id).await.unwrap();

        let meta = ks.get(&tenant, &id).await.unwrap();
        assert_eq!(meta.current_version, 3);
        assert_eq!(meta.versions.len(), 3);
        assert_eq!(meta.versions[0].version, 1);
        assert_eq!(meta.versions[1].version, 2);
        assert_eq!(meta.versions[2].version, 3);
    }

    #[tokio::test]
    async fn test_rotate_non_active_fails() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let result = ks.rotate(&tenant, &id).await;
        assert!(result.is_err());
    }

    // === Revocation ===

    #[tokio::test]
    async fn test_revoke_active_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.revoke(&tenant, &id, "security incident").await.unwrap();

        let meta = ks.get(&tenant, &id).await.unwrap();
        assert_eq!(meta.state, KeyState::Revoked);
        assert!(meta.revoked_at.is_some());
    }

    #[tokio::test]
    async fn test_update_metadata_changes_tags_not_algorithm() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();

        let mut tags = std::collections::HashMap::new();
        tags.insert("env".to_string(), "staging".to_string());
        let meta = ks.update_metadata(&tenant, &id, None, Some(tags.clone())).await.unwrap();

        assert_eq!(meta.tags, tags);
        assert_eq!(meta.algorithm, AlgorithmFamily::Aes);
    }

    #[tokio::test]
    async fn test_disable_pool_blocks_add_material_not_encrypt() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.disable_pool(&tenant, &id).await.unwrap();

        let rotate_result = ks.rotate(&tenant, &id).await;
        assert!(rotate_result.is_err());

        // encrypt is unaffected -- disable_pool only blocks AddMaterial.
        let encrypt_result = ks.encrypt(&tenant, &id, b"still works", b"aad").await;
        assert!(encrypt_result.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_material_blocks_encrypt_not_decrypt() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let blob = ks.encrypt(&tenant, &id, b"before revoke", b"aad").await.unwrap();

        ks.revoke_material(&tenant, &id, 1).await.unwrap();

        let encrypt_result = ks.encrypt(&tenant, &id, b"after revoke", b"aad").await;
        assert!(encrypt_result.is_err());

        // Invariant 5: decrypt of material already issued keeps working.
        let decrypted = ks.decrypt(&tenant, &blob, b"aad").await.unwrap();
        assert_eq!(decrypted, b"before revoke");
    }

    #[tokio::test]
    async fn test_get_material_public_requires_export_allowed() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Rsa, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        // export_allowed defaults to false at generation time.
        let result = ks.get_material_public(&tenant, &id, 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_material_public_rejects_symmetric_family() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.update_metadata(&tenant, &id, None, None).await.unwrap();

        let result = ks.get_material_public(&tenant, &id, 1).await;
        assert!(result.is_err());
    }

    // === Destruction ===

    #[tokio::test]
    async fn test_destroy_revoked_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        ks.revoke(&tenant, &id, "test").await.unwrap();
        ks.destroy(&tenant, &id).await.unwrap();

        let meta = ks.get(&tenant, &id).await.unwrap();
        assert_eq!(meta.state, KeyState::Destroyed);
        assert!(meta.destroyed_at.is_some());
        assert_eq!(meta.versions[0].secret_key_hex, "DESTROYED");
        assert_eq!(meta.versions[0].public_key_hex, "DESTROYED");
    }

    #[tokio::test]
    async fn test_destroy_active_key_fails() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();
        let result = ks.destroy(&tenant, &id).await;
        assert!(result.is_err());
    }

    // === State Machine ===

    #[tokio::test]
    async fn test_state_machine_valid_transitions() {
        assert!(KeyState::Pending.can_transition_to(KeyState::Active));
        assert!(KeyState::Pending.can_transition_to(KeyState::Destroyed));
        assert!(KeyState::Active.can_transition_to(KeyState::Rotated));
        assert!(KeyState::Active.can_transition_to(KeyState::Revoked));
        assert!(KeyState::Active.can_transition_to(KeyState::Expired));
        assert!(KeyState::Rotated.can_transition_to(KeyState::Expired));
        assert!(KeyState::Expired.can_transition_to(KeyState::Destroyed));
        assert!(KeyState::Revoked.can_transition_to(KeyState::Destroyed));
    }

    #[tokio::test]
    async fn test_state_machine_invalid_transitions() {
        assert!(!KeyState::Pending.can_transition_to(KeyState::Rotated));
        assert!(!KeyState::Active.can_transition_to(KeyState::Pending));
        assert!(!KeyState::Rotated.can_transition_to(KeyState::Active));
        assert!(!KeyState::Expired.can_transition_to(KeyState::Active));
        assert!(!KeyState::Destroyed.can_transition_to(KeyState::Active));
    }

    // === Encrypt / Decrypt ===

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip_aes() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let aad = b"test-aad";
        let plaintext = b"hello from kms keystore";

        let blob = ks.encrypt(&tenant, &id, plaintext, aad).await.unwrap();
        assert_eq!(blob.key_version, 1);

        let decrypted = ks.decrypt(&tenant, &blob, aad).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip_rsa() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Rsa, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let aad = b"test-aad";
        let plaintext = b"hello asymmetric";

        let blob = ks.encrypt(&tenant, &id, plaintext, aad).await.unwrap();
        let decrypted = ks.decrypt(&tenant, &blob, aad).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_sign_verify_roundtrip_hmac() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "mac-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Hmac, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let message = b"attest this payload";
        let signature = ks.sign(&tenant, &id, message).await.unwrap();
        assert!(ks.verify(&tenant, &id, message, &signature).await.unwrap());
        assert!(!ks.verify(&tenant, &id, b"different payload", &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_sign_rejects_disallowed_family() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "aes-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let result = ks.sign(&tenant, &id, b"data").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sign_unimplemented_for_asymmetric_families() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "rsa-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Rsa, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        // permitted_operations().sign is true for RSA, but no signature engine
        // backs the hybrid-KEM keypair yet -- the call must fail loudly, not
        // return a fabricated signature.
        let result = ks.sign(&tenant, &id, b"data").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_generate_random_returns_requested_length_and_varies() {
        let ks = test_keystore();
        let a = ks.generate_random(32);
        let b = ks.generate_random(32);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_encrypt_rejects_disallowed_family() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Ec, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let result = ks.encrypt(&tenant, &id, b"data", b"aad").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_encrypt_increments_usage_count() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        for i in 1..=5 {
            ks.encrypt(&tenant, &id, b"data", b"aad").await.unwrap();
            let meta = ks.get(&tenant, &id).await.unwrap();
            assert_eq!(meta.usage_count, i);
        }
    }

    #[tokio::test]
    async fn test_encrypt_with_pending_key_fails() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let result = ks.encrypt(&tenant, &id, b"data", b"aad").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decrypt_with_wrong_aad_fails() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let blob = ks.encrypt(&tenant, &id, b"data", b"correct-aad").await.unwrap();
        let result = ks.decrypt(&tenant, &blob, b"wrong-aad").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decrypt_after_rotation_uses_correct_version() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let blob_v1 = ks.encrypt(&tenant, &id, b"version one", b"aad").await.unwrap();
        assert_eq!(blob_v1.key_version, 1);

        ks.rotate(&tenant, &id).await.unwrap();

        let blob_v2 = ks.encrypt(&tenant, &id, b"version two", b"aad").await.unwrap();
        assert_eq!(blob_v2.key_version, 2);

        let pt1 = ks.decrypt(&tenant, &blob_v1, b"aad").await.unwrap();
        let pt2 = ks.decrypt(&tenant, &blob_v2, b"aad").await.unwrap();
        assert_eq!(pt1, b"version one");
        assert_eq!(pt2, b"version two");
    }

    // === Policy Evaluation ===

    #[tokio::test]
    async fn test_policy_compliant() {
        let mut ks = test_keystore();
        let tenant = test_tenant();
        let policy = KeyPolicy::default_dek();
        let pid = policy.id.clone();
        ks.register_policy(policy);

        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, Some(pid), None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let verdict = ks.evaluate_policy(&tenant, &id).await.unwrap();
        assert!(matches!(verdict, PolicyVerdict::Compliant));
    }

    #[tokio::test]
    async fn test_policy_usage_limit() {
        let mut ks = test_keystore();
        let tenant = test_tenant();
        let policy = KeyPolicy {
            id: PolicyId::new("limited"),
            name: "Limited".into(),
            applies_to: vec![KeyType::DataEncrypting],
            rotation_triggers: vec![],
            rotation_grace_period: Duration::from_secs(86400),
            max_lifetime: None,
            max_usage_count: Some(10),
            auto_rotate: false,
            min_versions_retained: 1,
        };
        let pid = policy.id.clone();
        ks.register_policy(policy);

        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, Some(pid), None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        for _ in 0..10 {
            ks.encrypt(&tenant, &id, b"data", b"aad").await.unwrap();
        }

        let verdict = ks.evaluate_policy(&tenant, &id).await.unwrap();
        assert!(verdict.needs_rotation());
    }

    // === Audit ===

    #[tokio::test]
    async fn test_audit_events_generated() {
        let (ks, audit) = test_keystore_with_audit();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let events = audit.events().await;
        assert!(events.len() >= 2); // generate + activate
    }

    #[tokio::test]
    async fn test_audit_tracks_encryption() {
        let (ks, audit) = test_keystore_with_audit();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        ks.encrypt(&tenant, &id, b"data", b"aad").await.unwrap();

        let events = audit.events_for_key(&id).await;
        let has_encrypt = events.iter().any(|e| matches!(e.action, crate::audit::AuditAction::EncryptionPerformed { .. }));
        assert!(has_encrypt);
    }

    // === List Operations ===

    #[tokio::test]
    async fn test_list_keys() {
        let ks = test_keystore();
        let tenant = test_tenant();
        for i in 0..5 {
            ks.generate(&tenant, format!("key-{}", i), "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        }
        let keys = ks.list_keys(&tenant).await.unwrap();
        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn test_list_by_state() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id1 = ks.generate(&tenant, "key1", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let id2 = ks.generate(&tenant, "key2", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        let _id3 = ks.generate(&tenant, "key3", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();

        ks.activate(&tenant, &id1).await.unwrap();
        ks.activate(&tenant, &id2).await.unwrap();

        let active = ks.list_by_state(&tenant, KeyState::Active).await.unwrap();
        let pending = ks.list_by_state(&tenant, KeyState::Pending).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_list_by_pool() {
        let ks = test_keystore();
        let tenant = test_tenant();
        ks.generate(&tenant, "k1", "", "payments", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.generate(&tenant, "k2", "", "payments", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.generate(&tenant, "k3", "", "shipping", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();

        let payments = ks.list_by_pool(&tenant, "payments").await.unwrap();
        assert_eq!(payments.len(), 2);
    }

    // === Encrypted Blob Serialization ===

    #[tokio::test]
    async fn test_encrypted_blob_serialization() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let blob = ks.encrypt(&tenant, &id, b"secret", b"aad").await.unwrap();

        let json = serde_json::to_string(&blob).unwrap();
        let restored: EncryptedBlob = serde_json::from_str(&json).unwrap();

        let decrypted = ks.decrypt(&tenant, &restored, b"aad").await.unwrap();
        assert_eq!(decrypted, b"secret");
    }

    // === Full Lifecycle ===

    #[tokio::test]
    async fn test_full_lifecycle() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "lifecycle-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();

        ks.activate(&tenant, &id).await.unwrap();
        assert_eq!(ks.get(&tenant, &id).await.unwrap().state, KeyState::Active);

        let blob = ks.encrypt(&tenant, &id, b"important data", b"aad").await.unwrap();

        ks.rotate(&tenant, &id).await.unwrap();
        assert_eq!(ks.get(&tenant, &id).await.unwrap().state, KeyState::Active);
        assert_eq!(ks.get(&tenant, &id).await.unwrap().current_version, 2);

        let pt = ks.decrypt(&tenant, &blob, b"aad").await.unwrap();
        assert_eq!(pt, b"important data");

        ks.revoke(&tenant, &id, "end of life").await.unwrap();
        assert_eq!(ks.get(&tenant, &id).await.unwrap().state, KeyState::Revoked);

        ks.destroy(&tenant, &id).await.unwrap();
        assert_eq!(ks.get(&tenant, &id).await.unwrap().state, KeyState::Destroyed);
    }

    // === Key Not Found ===

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let result = ks.get(&tenant, &KeyId::new("does-not-exist")).await;
        assert!(result.is_err());
    }

    // === Barrier Ceremony ===

    #[tokio::test]
    async fn test_keystore_starts_unsealed_in_tests() {
        let ks = test_keystore();
        assert!(!ks.is_sealed());
    }

    #[tokio::test]
    async fn test_seal_blocks_further_crypto() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let id = ks.generate(&tenant, "key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes, KeyProvider::Internal, true, false, None, None).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        ks.seal();
        assert!(ks.is_sealed());

        let result = ks.encrypt(&tenant, &id, b"data", b"aad").await;
        assert!(result.is_err());
    }

    // =======================================================================
    // Adaptive Threat Level Tests
    // =======================================================================

    #[test]
    fn test_threat_level_basics() {
        let assessor = ThreatAssessor::new(ThreatConfig::default());
        assert_eq!(assessor.current_level(), ThreatLevel::Low);
        assert_eq!(assessor.raw_score(), 0.0);
    }

    #[test]
    fn test_threat_level_escalation() {
        let mut assessor = ThreatAssessor::new(ThreatConfig {
            thresholds: [5.0, 15.0, 30.0, 50.0],
            ..Default::default()
        });

        for _ in 0..3 {
            assessor.record_event(ThreatEvent::new(ThreatEventKind::DecryptionFailure, 3.0));
        }
        assert!(assessor.current_level() >= ThreatLevel::Guarded);

        for _ in 0..5 {
            assessor.record_event(ThreatEvent::new(ThreatEventKind::RapidAccessPattern, 4.0));
        }
        assert!(assessor.current_level() >= ThreatLevel::Elevated);
    }

    #[test]
    fn test_threat_manual_escalation() {
        let mut assessor = ThreatAssessor::new(ThreatConfig::default());
        assert_eq!(assessor.current_level(), ThreatLevel::Low);

        assessor.record_event(ThreatEvent::new(ThreatEventKind::ManualEscalation, 0.0));
        assert_eq!(assessor.current_level(), ThreatLevel::Guarded);

        assessor.record_event(ThreatEvent::new(ThreatEventKind::ManualEscalation, 0.0));
        assert_eq!(assessor.current_level(), ThreatLevel::Elevated);

        assessor.record_event(ThreatEvent::new(ThreatEventKind::ManualDeescalation, 0.0));
        assert_eq!(assessor.current_level(), ThreatLevel::Low);
    }

    #[test]
    fn test_threat_level_display() {
        assert_eq!(ThreatLevel::Low.label(), "LOW");
        assert_eq!(ThreatLevel::Critical.label(), "CRITICAL");
        assert_eq!(ThreatLevel::Critical.value(), 5);
        assert!(ThreatLevel::Critical.color().starts_with('#'));
    }

    #[test]
    fn test_threat_event_with_detail() {
        let event = ThreatEvent::new(ThreatEventKind::ExternalAdvisory, 8.0)
            .with_detail("CVE-2026-1234 published");
        assert_eq!(event.detail.unwrap(), "CVE-2026-1234 published");
        assert_eq!(event.severity, 8.0);
    }

    #[test]
    fn test_threat_severity_clamping() {
        let event = ThreatEvent::new(ThreatEventKind::DecryptionFailure, 999.0);
        assert_eq!(event.severity, 10.0);

        let event2 = ThreatEvent::new(ThreatEventKind::DecryptionFailure, -5.0);
        assert_eq!(event2.severity, 0.0);
    }

    // === Policy Adapter Tests ===

    #[test]
    fn test_policy_adapter_low_threat_no_change() {
        let base = KeyPolicy::default_dek();
        let adapted = PolicyAdapter::adapt(&base, ThreatLevel::Low);

        assert_eq!(adapted.rotation_grace_period, base.rotation_grace_period);
        assert_eq!(adapted.max_lifetime, base.max_lifetime);
        assert_eq!(adapted.auto_rotate, base.auto_rotate);
    }

    #[test]
    fn test_policy_adapter_critical_compresses_everything() {
        let base = KeyPolicy::default_dek();
        let adapted = PolicyAdapter::adapt(&base, ThreatLevel::Critical);

        let expected_grace = Duration::from_secs(
            (base.rotation_grace_period.as_secs() as f64 * 0.1) as u64
        );
        assert_eq!(adapted.rotation_grace_period, expected_grace);

        let expected_lifetime = base.max_lifetime.map(|d| {
            Duration::from_secs((d.as_secs() as f64 * 0.25) as u64)
        });
        assert_eq!(adapted.max_lifetime, expected_lifetime);

        assert!(adapted.auto_rotate);
        assert!(adapted.name.contains("CRITICAL"));
    }

    #[test]
    fn test_policy_adapter_elevated_forces_auto_rotate() {
        let mut base = KeyPolicy::default_dek();
        base.auto_rotate = false;
        let adapted = PolicyAdapter::adapt(&base, ThreatLevel::Elevated);
        assert!(adapted.auto_rotate);
    }

    #[test]
    fn test_policy_adapter_guarded_does_not_force_auto_rotate() {
        let mut base = KeyPolicy::default_dek();
        base.auto_rotate = false;
        let adapted = PolicyAdapter::adapt(&base, ThreatLevel::Guarded);
        assert!(!adapted.auto_rotate);
    }

    #[test]
    fn test_policy_adapter_scales_usage_limit() {
        let mut base = KeyPolicy::default_dek();
        base.max_usage_count = Some(1000);
        let adapted = PolicyAdapter::adapt(&base, ThreatLevel::High);
        assert_eq!(adapted.max_usage_count, Some(400));
    }

    #[test]
    fn test_policy_adaptation_summary() {
        let base = KeyPolicy::default_dek();
        let summary = PolicyAdapter::summarize(&base, ThreatLevel::Critical);
        assert_eq!(summary.threat_level, ThreatLevel::Critical);
        assert!(summary.auto_rotate_forced);
        assert!(summary.effective_grace_period < summary.base_grace_period);
    }

    // === Keystore + Threat Integration Tests ===

    #[tokio::test]
    async fn test_keystore_threat_level_starts_low() {
        let ks = test_keystore();
        assert_eq!(ks.threat_level(), ThreatLevel::Low);
    }

    #[tokio::test]
    async fn test_keystore_record_threat_event() {
        let ks = test_keystore();
        ks.record_threat_event(
            ThreatEvent::new(ThreatEventKind::DecryptionFailure, 3.0)
        );
        assert!(ks.threat_score() > 0.0);
    }

    #[tokio::test]
    async fn test_keystore_threat_escalation_tightens_policy() {
        let mut ks = test_keystore();
        let tenant = test_tenant();
        ks.register_policy(KeyPolicy::default_dek());

        let id = ks.generate(
            &tenant, "threat-test-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes,
            KeyProvider::Internal, true, false,
            Some(PolicyId::new("default-dek")), None,
        ).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let base_grace = ks.policy_adaptation_summary(&PolicyId::new("default-dek"))
            .unwrap().effective_grace_period;

        for _ in 0..20 {
            ks.record_threat_event(
                ThreatEvent::new(ThreatEventKind::ExternalAdvisory, 8.0)
            );
        }
        assert!(ks.threat_level() >= ThreatLevel::High);

        let adapted_grace = ks.policy_adaptation_summary(&PolicyId::new("default-dek"))
            .unwrap().effective_grace_period;
        assert!(adapted_grace < base_grace,
            "Expected grace period to shrink: base={:?}, adapted={:?}", base_grace, adapted_grace);
    }

    #[tokio::test]
    async fn test_security_metrics() {
        let ks = test_keystore();
        let tenant = test_tenant();
        let metrics = ks.security_metrics(&tenant).await.unwrap();

        assert_eq!(metrics.threat_level, ThreatLevel::Low);
        assert!(metrics.overall > 0.0);
        assert!(metrics.quantum_resistance > 80.0);
        assert!(metrics.classical_security > 90.0);
        assert_eq!(metrics.key_hygiene, 100.0); // No keys = 100% compliant
    }

    #[tokio::test]
    async fn test_threat_history_tracks_transitions() {
        let ks = test_keystore();
        assert_eq!(ks.threat_history().len(), 1);

        ks.record_threat_event(ThreatEvent::new(ThreatEventKind::ManualEscalation, 0.0));
        assert!(ks.threat_history().len() >= 2);
    }

    #[tokio::test]
    async fn test_adaptive_policy_evaluation() {
        let mut ks = test_keystore();
        let tenant = test_tenant();

        let mut dek_policy = KeyPolicy::default_dek();
        dek_policy.max_usage_count = Some(1000);
        ks.register_policy(dek_policy);

        let id = ks.generate(
            &tenant, "adaptive-eval-key", "", "pool", KeyType::DataEncrypting, AlgorithmFamily::Aes,
            KeyProvider::Internal, true, false,
            Some(PolicyId::new("default-dek")), None,
        ).await.unwrap();
        ks.activate(&tenant, &id).await.unwrap();

        let verdict = ks.evaluate_adaptive_policy(&tenant, &id).await.unwrap();
        assert!(matches!(verdict, PolicyVerdict::Compliant));
    }
}
