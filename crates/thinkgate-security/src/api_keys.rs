//! Process-wide API key store.
//!
//! Raw secrets are returned exactly once, from [`ApiKeyManager::create`]. The
//! store only keeps an HMAC-SHA256 of each secret under a root key, so a
//! leaked snapshot file cannot be turned back into working credentials.
//!
//! Lifecycle: [`ApiKeyManager::init`] loads (or generates) the root key and any
//! previous snapshot; [`ApiKeyManager::shutdown`] flushes the snapshot and
//! zeroizes the root key. After shutdown every validation fails closed.

use crate::audit::AuditOutcome;
use crate::{AuditLog, Scope};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every issued secret; lets scanners recognise leaked keys.
pub const SECRET_PREFIX: &str = "tg_";

const SECRET_BYTES: usize = 32;
const ROOT_KEY_BYTES: usize = 32;

/// Errors from key store management (not from validation, see [`AuthFailure`]).
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// Configured root key material is unusable.
    #[error("root key is not valid hex or shorter than 16 bytes")]
    InvalidRootKey,
    /// No record has this key id.
    #[error("no API key with id '{0}'")]
    UnknownKey(String),
    /// The root key was wiped by shutdown.
    #[error("key store has been shut down")]
    ShutDown,
    /// The OS random source failed.
    #[error("random number generator failed: {0}")]
    Rng(String),
    /// Reading or writing the snapshot failed.
    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The snapshot is not valid JSON.
    #[error("snapshot parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<KeyStoreError> for thinkgate_core::ThinkgateError {
    fn from(e: KeyStoreError) -> Self {
        thinkgate_core::ThinkgateError::Security(e.to_string())
    }
}

/// Generic authentication failure.
///
/// Carries no detail on purpose: callers must not learn whether a secret was
/// unknown, revoked or expired. The specific reason is logged internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("authentication failed")]
pub struct AuthFailure;

impl From<AuthFailure> for thinkgate_core::ThinkgateError {
    fn from(_: AuthFailure) -> Self {
        thinkgate_core::ThinkgateError::Auth
    }
}

/// Why a validation failed. Internal only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectReason {
    Malformed,
    UnknownSecret,
    Revoked,
    Expired,
    ShutDown,
}

impl RejectReason {
    fn as_str(self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::UnknownSecret => "unknown_secret",
            RejectReason::Revoked => "revoked",
            RejectReason::Expired => "expired",
            RejectReason::ShutDown => "keystore_shut_down",
        }
    }
}

/// The stored record of an API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Public identifier, safe to log.
    pub key_id: String,
    /// Human-readable label.
    pub name: String,
    /// Hex HMAC-SHA256 of the secret under the store's root key.
    pub secret_hash: String,
    /// Permissions granted to this key. Fixed at creation.
    pub scopes: BTreeSet<Scope>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// No expiry when unset.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set once, by revocation. Never cleared.
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Whether the key was granted `scope`.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Whether the key has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Whether the key had expired at `now`. Expiry is inclusive.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Usable right now: neither revoked nor expired.
    pub fn is_active(&self) -> bool {
        !self.is_revoked() && !self.is_expired_at(Utc::now())
    }
}

/// A freshly created key together with its raw secret.
///
/// This is the only place the secret ever appears; `Debug` redacts it.
pub struct IssuedKey {
    /// The record as stored.
    pub record: ApiKeyRecord,
    /// Shown to the caller once and never stored.
    pub secret: String,
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("record", &self.record)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where the store keeps its state between restarts.
#[derive(Debug, Clone, Default)]
pub struct KeyStoreConfig {
    /// JSON snapshot of key records. `None` keeps keys in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// Hex root key material. Takes precedence over `root_key_path`.
    pub root_key_hex: Option<String>,
    /// File holding hex root key material; created if missing.
    pub root_key_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    root_key_fingerprint: String,
    keys: Vec<ApiKeyRecord>,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<String, ApiKeyRecord>,
    id_by_hash: HashMap<String, String>,
}

impl Records {
    fn insert(&mut self, record: ApiKeyRecord) {
        self.id_by_hash
            .insert(record.secret_hash.clone(), record.key_id.clone());
        self.by_id.insert(record.key_id.clone(), record);
    }
}

/// Issues, validates and revokes scoped API keys.
///
/// Read-mostly: validation takes a shared lock, create/revoke an exclusive
/// one, so a revocation is visible to the very next `validate` call.
pub struct ApiKeyManager {
    root_key: RwLock<Zeroizing<Vec<u8>>>,
    records: RwLock<Records>,
    snapshot_path: Option<PathBuf>,
    audit: Option<Arc<AuditLog>>,
}

impl ApiKeyManager {
    /// In-memory store with a freshly generated root key.
    pub fn ephemeral() -> Result<Self, KeyStoreError> {
        Ok(Self::with_root_key(generate_bytes(ROOT_KEY_BYTES)?, None))
    }

    fn with_root_key(root_key: Zeroizing<Vec<u8>>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            root_key: RwLock::new(root_key),
            records: RwLock::new(Records::default()),
            snapshot_path,
            audit: None,
        }
    }

    /// Loads root key material and any existing snapshot.
    pub async fn init(config: KeyStoreConfig) -> Result<Self, KeyStoreError> {
        let root_key = load_root_key(&config).await?;
        let manager = Self::with_root_key(root_key, config.snapshot_path.clone());

        if let Some(path) = &config.snapshot_path {
            if tokio::fs::try_exists(path).await? {
                let data = tokio::fs::read_to_string(path).await?;
                let snapshot: Snapshot = serde_json::from_str(&data)?;
                if snapshot.root_key_fingerprint != manager.fingerprint() {
                    warn!(
                        path = %path.display(),
                        "Key snapshot was written under a different root key; existing keys will not validate"
                    );
                }
                let mut records = manager.records.write();
                for record in snapshot.keys {
                    records.insert(record);
                }
                info!(keys = records.by_id.len(), "API key snapshot loaded");
            }
        }

        Ok(manager)
    }

    /// Attach an audit log for create/revoke/reject events.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Issue a new key. The returned secret is never retrievable again.
    pub fn create(
        &self,
        name: impl Into<String>,
        scopes: impl IntoIterator<Item = Scope>,
        ttl: Option<Duration>,
    ) -> Result<IssuedKey, KeyStoreError> {
        let secret_bytes = generate_bytes(SECRET_BYTES)?;
        let secret = format!("{SECRET_PREFIX}{}", hex::encode(secret_bytes.as_slice()));
        let secret_hash = self.hash_secret(&secret)?;

        let now = Utc::now();
        let record = ApiKeyRecord {
            key_id: format!("key_{}", Uuid::new_v4().simple()),
            name: name.into(),
            secret_hash,
            scopes: scopes.into_iter().collect(),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            revoked_at: None,
        };

        self.records.write().insert(record.clone());

        info!(key_id = %record.key_id, name = %record.name, scopes = ?record.scopes, "API key created");
        if let Some(audit) = &self.audit {
            audit.log_action(
                Some(record.key_id.as_str()),
                "key_created",
                serde_json::json!({"name": record.name, "scopes": record.scopes}),
                AuditOutcome::Success,
            );
        }

        Ok(IssuedKey { record, secret })
    }

    /// Validate a presented secret.
    ///
    /// Fails closed with a generic [`AuthFailure`]; the specific reason is
    /// logged (and audited) but never returned.
    pub fn validate(&self, raw_secret: &str) -> Result<ApiKeyRecord, AuthFailure> {
        match self.check(raw_secret) {
            Ok(record) => Ok(record),
            Err((reason, key_id)) => {
                warn!(
                    reason = reason.as_str(),
                    key_id = key_id.as_deref().unwrap_or("-"),
                    "API key rejected"
                );
                if let Some(audit) = &self.audit {
                    audit.log_action(
                        key_id.as_deref(),
                        "auth_rejected",
                        serde_json::json!({"reason": reason.as_str()}),
                        AuditOutcome::Denied,
                    );
                }
                Err(AuthFailure)
            }
        }
    }

    fn check(&self, raw_secret: &str) -> Result<ApiKeyRecord, (RejectReason, Option<String>)> {
        if !raw_secret.starts_with(SECRET_PREFIX) || raw_secret.len() <= SECRET_PREFIX.len() {
            return Err((RejectReason::Malformed, None));
        }
        let hash = self
            .hash_secret(raw_secret)
            .map_err(|_| (RejectReason::ShutDown, None))?;

        let records = self.records.read();
        let record = records
            .id_by_hash
            .get(&hash)
            .and_then(|id| records.by_id.get(id))
            .ok_or((RejectReason::UnknownSecret, None))?;

        if record.is_revoked() {
            return Err((RejectReason::Revoked, Some(record.key_id.clone())));
        }
        if record.is_expired_at(Utc::now()) {
            return Err((RejectReason::Expired, Some(record.key_id.clone())));
        }
        Ok(record.clone())
    }

    /// Revoke a key. Idempotent for already revoked keys.
    pub fn revoke(&self, key_id: &str) -> Result<ApiKeyRecord, KeyStoreError> {
        let mut records = self.records.write();
        let record = records
            .by_id
            .get_mut(key_id)
            .ok_or_else(|| KeyStoreError::UnknownKey(key_id.to_string()))?;

        if record.revoked_at.is_none() {
            record.revoked_at = Some(Utc::now());
            info!(key_id = %key_id, "API key revoked");
            if let Some(audit) = &self.audit {
                audit.log_action(
                    Some(key_id),
                    "key_revoked",
                    serde_json::json!({"name": record.name}),
                    AuditOutcome::Success,
                );
            }
        }
        Ok(record.clone())
    }

    /// Looks up a record by id, whatever its state.
    pub fn get(&self, key_id: &str) -> Option<ApiKeyRecord> {
        self.records.read().by_id.get(key_id).cloned()
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<ApiKeyRecord> {
        let mut all: Vec<ApiKeyRecord> = self.records.read().by_id.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_id.cmp(&b.key_id)));
        all
    }

    /// Number of keys that would currently validate.
    pub fn active_count(&self) -> usize {
        self.records
            .read()
            .by_id
            .values()
            .filter(|r| r.is_active())
            .count()
    }

    /// Write the record snapshot, if a snapshot path is configured.
    pub async fn flush(&self) -> Result<(), KeyStoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if self.root_key.read().is_empty() {
            return Err(KeyStoreError::ShutDown);
        }
        let snapshot = Snapshot {
            root_key_fingerprint: self.fingerprint(),
            keys: self.list(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), keys = snapshot.keys.len(), "API key snapshot written");
        Ok(())
    }

    /// Flush, then zeroize the root key. The store rejects everything afterwards.
    pub async fn shutdown(&self) -> Result<(), KeyStoreError> {
        let flushed = self.flush().await;
        self.root_key.write().zeroize();
        info!("API key store shut down");
        flushed
    }

    fn hash_secret(&self, secret: &str) -> Result<String, KeyStoreError> {
        let key = self.root_key.read();
        if key.is_empty() {
            return Err(KeyStoreError::ShutDown);
        }
        let mut mac =
            HmacSha256::new_from_slice(key.as_slice()).map_err(|_| KeyStoreError::InvalidRootKey)?;
        mac.update(secret.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.root_key.read().as_slice());
        hex::encode(&digest[..8])
    }
}

fn generate_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    getrandom::getrandom(buf.as_mut_slice()).map_err(|e| KeyStoreError::Rng(e.to_string()))?;
    Ok(buf)
}

fn decode_root_key(hex_str: &str) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_str.trim()).map_err(|_| KeyStoreError::InvalidRootKey)?,
    );
    if bytes.len() < 16 {
        return Err(KeyStoreError::InvalidRootKey);
    }
    Ok(bytes)
}

async fn load_root_key(config: &KeyStoreConfig) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    if let Some(hex_str) = &config.root_key_hex {
        return decode_root_key(hex_str);
    }

    let Some(path) = &config.root_key_path else {
        warn!("No root key configured; generated an ephemeral one");
        return generate_bytes(ROOT_KEY_BYTES);
    };

    if tokio::fs::try_exists(path).await? {
        let contents = Zeroizing::new(tokio::fs::read_to_string(path).await?);
        return decode_root_key(&contents);
    }

    let key = generate_bytes(ROOT_KEY_BYTES)?;
    write_root_key(path, &key).await?;
    info!(path = %path.display(), "Generated new root key");
    Ok(key)
}

async fn write_root_key(path: &Path, key: &[u8]) -> Result<(), KeyStoreError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let encoded = Zeroizing::new(hex::encode(key));
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager() -> ApiKeyManager {
        ApiKeyManager::ephemeral().unwrap()
    }

    #[test]
    fn create_then_validate() {
        let keys = manager();
        let issued = keys.create("ci", [Scope::Chat], None).unwrap();
        assert!(issued.secret.starts_with(SECRET_PREFIX));
        assert_eq!(issued.secret.len(), SECRET_PREFIX.len() + SECRET_BYTES * 2);

        let record = keys.validate(&issued.secret).unwrap();
        assert_eq!(record.key_id, issued.record.key_id);
        assert!(record.has_scope(Scope::Chat));
        assert!(!record.has_scope(Scope::Admin));
    }

    #[test]
    fn stored_hash_is_not_the_secret() {
        let keys = manager();
        let issued = keys.create("ci", [Scope::Chat], None).unwrap();
        let stored = keys.get(&issued.record.key_id).unwrap();
        assert_ne!(stored.secret_hash, issued.secret);
        assert!(!stored.secret_hash.contains(&issued.secret[SECRET_PREFIX.len()..]));
        assert_eq!(stored.secret_hash.len(), 64);
    }

    #[test]
    fn issued_key_debug_redacts_secret() {
        let keys = manager();
        let issued = keys.create("ci", [Scope::Chat], None).unwrap();
        let debug = format!("{issued:?}");
        assert!(!debug.contains(&issued.secret));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn rejection_reasons_are_distinguished_internally() {
        let keys = manager();
        assert_eq!(keys.check("nope").unwrap_err().0, RejectReason::Malformed);
        assert_eq!(
            keys.check("tg_deadbeef").unwrap_err().0,
            RejectReason::UnknownSecret
        );

        let revoked = keys.create("r", [Scope::Chat], None).unwrap();
        keys.revoke(&revoked.record.key_id).unwrap();
        let (reason, key_id) = keys.check(&revoked.secret).unwrap_err();
        assert_eq!(reason, RejectReason::Revoked);
        assert_eq!(key_id.as_deref(), Some(revoked.record.key_id.as_str()));

        let expired = keys
            .create("e", [Scope::Chat], Some(Duration::seconds(-1)))
            .unwrap();
        assert_eq!(keys.check(&expired.secret).unwrap_err().0, RejectReason::Expired);
    }

    #[test]
    fn all_rejections_look_the_same_to_callers() {
        let keys = manager();
        let revoked = keys.create("r", [Scope::Chat], None).unwrap();
        keys.revoke(&revoked.record.key_id).unwrap();

        let a = keys.validate("garbage").unwrap_err();
        let b = keys.validate(&revoked.secret).unwrap_err();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "authentication failed");
    }

    #[test]
    fn revoke_unknown_key() {
        let keys = manager();
        assert!(matches!(
            keys.revoke("key_missing"),
            Err(KeyStoreError::UnknownKey(_))
        ));
    }

    #[test]
    fn revoke_is_idempotent() {
        let keys = manager();
        let issued = keys.create("r", [Scope::Chat], None).unwrap();
        let first = keys.revoke(&issued.record.key_id).unwrap();
        let second = keys.revoke(&issued.record.key_id).unwrap();
        assert_eq!(first.revoked_at, second.revoked_at);
    }

    #[test]
    fn list_is_ordered_and_counts_active() {
        let keys = manager();
        let a = keys.create("a", [Scope::Chat], None).unwrap();
        let b = keys.create("b", [Scope::Admin], None).unwrap();
        keys.revoke(&a.record.key_id).unwrap();

        let listed = keys.list();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);
        assert_eq!(keys.active_count(), 1);
        assert!(keys.validate(&b.secret).is_ok());
    }

    #[test]
    fn secrets_are_unique() {
        let keys = manager();
        let mut seen = HashSet::new();
        for i in 0..10_000 {
            let issued = keys.create(format!("k{i}"), [Scope::Chat], None).unwrap();
            assert!(seen.insert(issued.secret), "duplicate secret at {i}");
        }
    }

    #[test]
    fn root_key_validation() {
        assert!(decode_root_key("zz").is_err());
        assert!(decode_root_key("00ff").is_err());
        assert_eq!(decode_root_key(&"ab".repeat(32)).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn shutdown_fails_closed() {
        let keys = manager();
        let issued = keys.create("ci", [Scope::Chat], None).unwrap();
        keys.shutdown().await.unwrap();

        assert!(keys.validate(&issued.secret).is_err());
        assert!(matches!(
            keys.create("late", [Scope::Chat], None),
            Err(KeyStoreError::ShutDown)
        ));
    }
}
