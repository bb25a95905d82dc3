//! Property-based tests for key lifecycle management.

use crypto_service::{
    AuditOperation, CallerContext, CryptoCore, CryptoCoreFactory, CryptoError, CryptoServiceConfig,
    InMemoryAuditLogger, KeyAlgorithm, KeyId, KeyState,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

async fn core(audit: &Arc<InMemoryAuditLogger>) -> CryptoCore {
    let config = CryptoServiceConfig::default()
        .with_master_key([11u8; 32])
        .with_chunk_size(1024);
    CryptoCoreFactory::new()
        .with_audit_logger(audit.clone())
        .create(&config)
        .await
        .unwrap()
}

fn ctx() -> CallerContext {
    CallerContext::new("prop-tester", "property-tests").with_correlation_id("corr-prop")
}

fn symmetric_algorithm() -> impl Strategy<Value = KeyAlgorithm> {
    prop_oneof![
        Just(KeyAlgorithm::Aes128Gcm),
        Just(KeyAlgorithm::Aes256Gcm),
        Just(KeyAlgorithm::Aes128Cbc),
        Just(KeyAlgorithm::Aes256Cbc),
    ]
}

// =============================================================================
// Property: KeyId Format
// *For any* valid components, rendering then parsing a KeyId SHALL return an
// equal id, and malformed strings SHALL be rejected.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_key_id_parse_inverse(
        namespace in "[a-z][a-z0-9-]{0,20}",
        unique_id in "[a-f0-9-]{1,36}",
        version in 1u32..10_000,
    ) {
        let id = KeyId::new(namespace.clone(), unique_id.clone(), version).unwrap();
        let rendered = id.to_string();
        prop_assert_eq!(&rendered, &format!("{namespace}:{unique_id}:v{version}"));
        prop_assert_eq!(KeyId::parse(&rendered).unwrap(), id);
    }

    #[test]
    fn prop_key_id_rejects_malformed(s in "[a-z0-9:]{0,30}") {
        let parts: Vec<&str> = s.split(':').collect();
        let well_formed = parts.len() == 3
            && !parts[0].is_empty()
            && !parts[1].is_empty()
            && parts[2].strip_prefix('v').and_then(|v| v.parse::<u32>().ok()).is_some_and(|v| v >= 1);
        if !well_formed {
            prop_assert!(matches!(KeyId::parse(&s), Err(CryptoError::InvalidInput(_))));
        }
    }
}

// =============================================================================
// Property: KeyId Uniqueness
// *For any* namespace, N sequential generations SHALL never collide.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn prop_generated_ids_unique(
        namespace in "[a-z]{1,12}",
        algorithm in symmetric_algorithm(),
        count in 5usize..30,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let audit = Arc::new(InMemoryAuditLogger::new());
            let core = core(&audit).await;

            let mut ids = HashSet::new();
            for _ in 0..count {
                let id = core.key_service
                    .generate_key(&namespace, algorithm, "owner", None, &ctx())
                    .await
                    .unwrap();
                prop_assert_eq!(id.namespace(), namespace.as_str());
                prop_assert_eq!(id.version(), 1);
                prop_assert!(ids.insert(id));
            }

            let listed = core.key_service.list_keys(&namespace).await.unwrap();
            prop_assert_eq!(listed.len(), count);
            Ok(())
        })?;
    }
}

// =============================================================================
// Property: Rotation State Machine
// *For any* chain of rotations, each new id SHALL differ from its predecessor,
// the predecessor SHALL be DEPRECATED and unable to encrypt but able to
// decrypt, and exactly the newest version SHALL be ACTIVE.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_rotation_chain(algorithm in symmetric_algorithm(), rotations in 1usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let audit = Arc::new(InMemoryAuditLogger::new());
            let core = core(&audit).await;
            let keys = &core.key_service;

            let first = keys.generate_key("chain", algorithm, "owner", None, &ctx()).await.unwrap();
            let mut chain = vec![first];
            for _ in 0..rotations {
                let old = chain.last().unwrap().clone();
                let new = keys.rotate_key(&old, &ctx()).await.unwrap();
                prop_assert_ne!(&new, &old);
                prop_assert_eq!(new.version(), old.version() + 1);

                prop_assert_eq!(keys.get_key_metadata(&old).await.unwrap().state, KeyState::Deprecated);
                prop_assert!(!keys.can_encrypt(&old).await.unwrap());
                prop_assert!(keys.can_decrypt(&old).await.unwrap());

                let meta = keys.get_key_metadata(&new).await.unwrap();
                prop_assert_eq!(meta.state, KeyState::Active);
                prop_assert_eq!(meta.previous_version, Some(old));
                chain.push(new);
            }

            let active: Vec<_> = {
                let mut active = Vec::new();
                for id in &chain {
                    if keys.get_key_metadata(id).await.unwrap().state == KeyState::Active {
                        active.push(id.clone());
                    }
                }
                active
            };
            prop_assert_eq!(active, vec![chain.last().unwrap().clone()]);

            // Deprecated keys cannot rotate again
            let rotated = keys.rotate_key(&chain[0], &ctx()).await;
            prop_assert!(matches!(rotated, Err(CryptoError::InvalidState(_))));
            Ok(())
        })?;
    }
}

// =============================================================================
// Property: Deleted Key Semantics
// *For any* key state, deleting a key SHALL make every later lookup and a
// second delete fail with KEY_NOT_FOUND, and SHALL emit one audit event per call.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_deleted_key_semantics(algorithm in symmetric_algorithm(), rotate_first in any::<bool>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let audit = Arc::new(InMemoryAuditLogger::new());
            let core = core(&audit).await;
            let keys = &core.key_service;

            let id = keys.generate_key("retire", algorithm, "owner", None, &ctx()).await.unwrap();
            keys.get_key_material(&id).await.unwrap();
            if rotate_first {
                keys.rotate_key(&id, &ctx()).await.unwrap();
            }

            keys.delete_key(&id, &ctx()).await.unwrap();

            prop_assert!(matches!(keys.get_key_material(&id).await, Err(CryptoError::KeyNotFound(_))));
            prop_assert!(matches!(keys.get_key_metadata(&id).await, Err(CryptoError::KeyNotFound(_))));
            prop_assert!(matches!(keys.can_decrypt(&id).await, Err(CryptoError::KeyNotFound(_))));
            prop_assert!(matches!(keys.rotate_key(&id, &ctx()).await, Err(CryptoError::KeyNotFound(_))));
            prop_assert!(matches!(keys.delete_key(&id, &ctx()).await, Err(CryptoError::KeyNotFound(_))));

            let deletes = audit.entries_for(AuditOperation::KeyDelete);
            prop_assert_eq!(deletes.len(), 2);
            prop_assert!(deletes[0].success);
            prop_assert!(!deletes[1].success);
            Ok(())
        })?;
    }
}

// =============================================================================
// Property: Material Non-Exposure
// *For any* generated key, metadata, audit entries and debug output SHALL NOT
// contain the raw key material.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_material_not_exposed(algorithm in symmetric_algorithm()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let audit = Arc::new(InMemoryAuditLogger::new());
            let core = core(&audit).await;
            let keys = &core.key_service;

            let id = keys.generate_key("secrets", algorithm, "owner", None, &ctx()).await.unwrap();
            let material = keys.get_key_material(&id).await.unwrap();
            prop_assert_eq!(material.len(), algorithm.key_size());

            let hex: String = material.expose().iter().map(|b| format!("{b:02x}")).collect();
            let metadata_json = serde_json::to_string(&keys.get_key_metadata(&id).await.unwrap()).unwrap();
            prop_assert!(!metadata_json.contains(&hex));

            let debug = format!("{material:?}");
            prop_assert!(!debug.contains(&hex));
            let exposed_debug = format!("{:?}", material.expose());
            prop_assert!(!debug.contains(&exposed_debug));

            for entry in audit.entries() {
                let json = entry.to_json();
                prop_assert!(!json.contains(&hex));
                prop_assert_eq!(entry.correlation_id.as_str(), "corr-prop");
            }
            Ok(())
        })?;
    }
}

// =============================================================================
// Property: Audit Completeness
// *For any* sequence of generate/rotate/delete calls, exactly one audit entry
// SHALL be emitted per mutating call, successful or not.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_one_audit_event_per_mutation(ops in prop::collection::vec(0u8..3, 1..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let audit = Arc::new(InMemoryAuditLogger::new());
            let core = core(&audit).await;
            let keys = &core.key_service;

            let mut current = keys
                .generate_key("audited", KeyAlgorithm::Aes256Gcm, "owner", None, &ctx())
                .await
                .unwrap();
            let mut expected = 1;
            for op in ops {
                match op {
                    0 => {
                        current = keys
                            .generate_key("audited", KeyAlgorithm::Aes256Gcm, "owner", None, &ctx())
                            .await
                            .unwrap();
                    }
                    1 => {
                        if let Ok(new) = keys.rotate_key(&current, &ctx()).await {
                            current = new;
                        }
                    }
                    _ => {
                        let _ = keys.delete_key(&current, &ctx()).await;
                    }
                }
                expected += 1;
            }
            prop_assert_eq!(audit.entries().len(), expected);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_concurrent_reads_of_distinct_keys() {
    let audit = Arc::new(InMemoryAuditLogger::new());
    let core = core(&audit).await;

    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(
            core.key_service
                .generate_key("parallel", KeyAlgorithm::Aes256Gcm, "owner", None, &ctx())
                .await
                .unwrap(),
        );
    }
    core.cache.clear_local_cache();

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let keys = Arc::clone(&core.key_service);
            tokio::spawn(async move { keys.get_key_material(&id).await.map(|m| m.len()) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 32);
    }
}
