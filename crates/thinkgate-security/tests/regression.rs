#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for thinkgate-security: key store lifecycle and
//! persistence, audit log output, rate limiting.

use std::sync::Arc;
use thinkgate_security::{ApiKeyManager, AuditLog, KeyStoreConfig, Scope};

// --- ApiKeyManager persistence ---

#[tokio::test]
async fn snapshot_survives_restart_with_same_root_key() {
    let tmp = tempfile::tempdir().unwrap();
    let config = KeyStoreConfig {
        snapshot_path: Some(tmp.path().join("keys.json")),
        root_key_hex: None,
        root_key_path: Some(tmp.path().join("root.key")),
    };

    let keys = ApiKeyManager::init(config.clone()).await.unwrap();
    let issued = keys.create("ci", [Scope::Chat, Scope::Admin], None).unwrap();
    keys.shutdown().await.unwrap();

    let snapshot = tokio::fs::read_to_string(tmp.path().join("keys.json"))
        .await
        .unwrap();
    assert!(snapshot.contains(&issued.record.key_id));
    assert!(!snapshot.contains(&issued.secret));

    let reloaded = ApiKeyManager::init(config).await.unwrap();
    let record = reloaded.validate(&issued.secret).unwrap();
    assert_eq!(record.key_id, issued.record.key_id);
    assert!(record.has_scope(Scope::Admin));
}

#[tokio::test]
async fn different_root_key_invalidates_snapshot_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_path = Some(tmp.path().join("keys.json"));

    let first = ApiKeyManager::init(KeyStoreConfig {
        snapshot_path: snapshot_path.clone(),
        root_key_hex: Some("11".repeat(32)),
        root_key_path: None,
    })
    .await
    .unwrap();
    let issued = first.create("ci", [Scope::Chat], None).unwrap();
    first.flush().await.unwrap();

    let second = ApiKeyManager::init(KeyStoreConfig {
        snapshot_path,
        root_key_hex: Some("22".repeat(32)),
        root_key_path: None,
    })
    .await
    .unwrap();
    assert_eq!(second.list().len(), 1);
    assert!(second.validate(&issued.secret).is_err());
}

#[tokio::test]
async fn root_key_file_is_created_and_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let root_path = tmp.path().join("secrets").join("root.key");
    let config = KeyStoreConfig {
        snapshot_path: None,
        root_key_hex: None,
        root_key_path: Some(root_path.clone()),
    };

    let a = ApiKeyManager::init(config.clone()).await.unwrap();
    let issued = a.create("ci", [Scope::Chat], None).unwrap();
    let first_contents = tokio::fs::read_to_string(&root_path).await.unwrap();
    assert_eq!(first_contents.len(), 64);

    // Same root key, no snapshot: the record is gone but hashing is stable.
    let b = ApiKeyManager::init(config).await.unwrap();
    let second_contents = tokio::fs::read_to_string(&root_path).await.unwrap();
    assert_eq!(first_contents, second_contents);
    assert!(b.validate(&issued.secret).is_err());
}

// --- Revocation visibility ---

#[tokio::test]
async fn revocation_is_visible_to_the_next_validate() {
    let keys = Arc::new(ApiKeyManager::ephemeral().unwrap());
    let issued = keys.create("ci", [Scope::Chat], None).unwrap();

    for _ in 0..100 {
        assert!(keys.validate(&issued.secret).is_ok());
    }
    keys.revoke(&issued.record.key_id).unwrap();
    assert!(keys.validate(&issued.secret).is_err());
}

#[tokio::test]
async fn concurrent_validators_never_see_a_revoked_key_after_revoke_returns() {
    let keys = Arc::new(ApiKeyManager::ephemeral().unwrap());
    let issued = keys.create("ci", [Scope::Chat], None).unwrap();
    let secret = Arc::new(issued.secret.clone());

    keys.revoke(&issued.record.key_id).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let keys = keys.clone();
        let secret = secret.clone();
        handles.push(tokio::spawn(async move {
            (0..200).all(|_| keys.validate(&secret).is_err())
        }));
    }
    for h in handles {
        assert!(h.await.unwrap());
    }
}

// --- AuditLog ---

#[tokio::test]
async fn audit_log_records_key_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::new(tmp.path().join("audit")));
    let keys = ApiKeyManager::ephemeral().unwrap().with_audit(audit);

    let issued = keys.create("ops", [Scope::Admin], None).unwrap();
    keys.revoke(&issued.record.key_id).unwrap();
    let _ = keys.validate(&issued.secret);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let contents = tokio::fs::read_to_string(tmp.path().join("audit").join("audit.jsonl"))
        .await
        .unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("key_created"));
    assert!(lines[1].contains("key_revoked"));
    assert!(lines[2].contains("auth_rejected"));
    assert!(lines[2].contains("revoked"));
    assert!(!contents.contains(&issued.secret));
}
