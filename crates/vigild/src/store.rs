use std::path::Path;

use thiserror::Error;
use tokio_rusqlite::Connection;
use vigil_core::FaceDescriptor;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {got} (expected {expected})")]
    InvalidDimension { expected: usize, got: usize },
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
    #[error("a profile needs at least one descriptor")]
    EmptyProfile,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed profile storage with AES-256-GCM encryption.
///
/// A user's profile is the ordered set of descriptors captured by one
/// enrollment, one row per pose step. Descriptors are encrypted before
/// storage; the per-installation 32-byte key lives at `{db_dir}/.key`
/// (mode 0600).
#[derive(Clone)]
pub struct DescriptorStore {
    conn: Connection,
    enc_key: [u8; 32],
    dim: usize,
}

impl DescriptorStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, dim: usize) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/vigil"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS descriptors (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     step_index INTEGER NOT NULL,
                     descriptor BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_descriptors_user ON descriptors(user);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Replace the user's profile with `descriptors`, in step order.
    ///
    /// Old rows are deleted and new rows inserted in one transaction: a
    /// failure leaves the previous profile intact.
    pub async fn replace_profile(
        &self,
        user: &str,
        descriptors: &[FaceDescriptor],
        model_version: &str,
    ) -> Result<usize, StoreError> {
        if descriptors.is_empty() {
            return Err(StoreError::EmptyProfile);
        }
        let blobs = descriptors
            .iter()
            .map(|d| self.encrypt_descriptor(d.values()))
            .collect::<Result<Vec<_>, _>>()?;

        let user = user.to_string();
        let model_version = model_version.to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        let stored = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM descriptors WHERE user = ?1", [&user])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO descriptors (id, user, step_index, descriptor, model_version, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for (step, blob) in blobs.iter().enumerate() {
                        stmt.execute(rusqlite::params![
                            uuid::Uuid::new_v4().to_string(),
                            user,
                            step as i64,
                            blob,
                            model_version,
                            created_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(blobs.len())
            })
            .await?;

        Ok(stored)
    }

    /// Decrypted descriptors of the user's profile in step order. Empty when
    /// the user is not enrolled.
    pub async fn profile_for_user(&self, user: &str) -> Result<Vec<FaceDescriptor>, StoreError> {
        let user = user.to_string();

        // Decrypt outside the blocking closure.
        let blobs: Vec<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT descriptor FROM descriptors WHERE user = ?1 ORDER BY step_index",
                )?;
                let rows = stmt.query_map([&user], |row| row.get::<_, Vec<u8>>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        blobs
            .iter()
            .map(|blob| self.decrypt_descriptor(blob).map(FaceDescriptor::new))
            .collect()
    }

    /// Profile metadata for a user (no descriptor data).
    pub async fn list_by_user(&self, user: &str) -> Result<Vec<DescriptorInfo>, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, step_index, model_version, created_at
                     FROM descriptors WHERE user = ?1 ORDER BY step_index",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok(DescriptorInfo {
                        id: row.get(0)?,
                        step_index: row.get(1)?,
                        model_version: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete the user's whole profile. Returns the number of rows removed.
    pub async fn remove_profile(&self, user: &str) -> Result<usize, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM descriptors WHERE user = ?1", [&user])?;
                Ok(affected)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count stored descriptors across all users.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM descriptors", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_descriptor(values, self.dim)?;
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor(&plaintext, self.dim)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// with mode 0600.
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dim * 4 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    validate_descriptor(&values, dim)?;
    Ok(values)
}

fn validate_descriptor(values: &[f32], dim: usize) -> Result<(), StoreError> {
    if values.len() != dim {
        return Err(StoreError::InvalidDimension {
            expected: dim,
            got: values.len(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about one stored descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DescriptorInfo {
    pub id: String,
    pub step_index: i64,
    pub model_version: String,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 128;

    fn descriptor(seed: f32) -> FaceDescriptor {
        FaceDescriptor::new((0..DIM).map(|i| seed + i as f32 / DIM as f32).collect())
    }

    async fn memory_store() -> DescriptorStore {
        DescriptorStore::open(Path::new(":memory:"), DIM).await.unwrap()
    }

    #[tokio::test]
    async fn profile_roundtrip_keeps_step_order() {
        let store = memory_store().await;
        let profile: Vec<_> = (0..4).map(|i| descriptor(i as f32)).collect();

        let stored = store.replace_profile("alice", &profile, "v1").await.unwrap();
        assert_eq!(stored, 4);

        let loaded = store.profile_for_user("alice").await.unwrap();
        assert_eq!(loaded, profile);

        let info = store.list_by_user("alice").await.unwrap();
        let steps: Vec<i64> = info.iter().map(|i| i.step_index).collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
        assert!(info.iter().all(|i| i.model_version == "v1"));
    }

    #[tokio::test]
    async fn reenrollment_replaces_previous_profile() {
        let store = memory_store().await;
        let first: Vec<_> = (0..4).map(|i| descriptor(i as f32)).collect();
        let second: Vec<_> = (10..12).map(|i| descriptor(i as f32)).collect();

        store.replace_profile("alice", &first, "v1").await.unwrap();
        store.replace_profile("alice", &second, "v2").await.unwrap();

        assert_eq!(store.profile_for_user("alice").await.unwrap(), second);
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_profile_leaves_old_one_intact() {
        let store = memory_store().await;
        let good: Vec<_> = (0..4).map(|i| descriptor(i as f32)).collect();
        store.replace_profile("alice", &good, "v1").await.unwrap();

        let short = vec![descriptor(9.0), FaceDescriptor::new(vec![0.0; 3])];
        let err = store.replace_profile("alice", &short, "v2").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDimension { expected: DIM, got: 3 }));

        let err = store.replace_profile("alice", &[], "v2").await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyProfile));

        assert_eq!(store.profile_for_user("alice").await.unwrap(), good);
    }

    #[tokio::test]
    async fn profiles_are_per_user() {
        let store = memory_store().await;
        store.replace_profile("alice", &[descriptor(0.0)], "v1").await.unwrap();
        store.replace_profile("bob", &[descriptor(1.0), descriptor(2.0)], "v1").await.unwrap();

        assert!(store.profile_for_user("carol").await.unwrap().is_empty());
        assert_eq!(store.count_all().await.unwrap(), 3);

        assert_eq!(store.remove_profile("bob").await.unwrap(), 2);
        assert_eq!(store.remove_profile("bob").await.unwrap(), 0);
        assert_eq!(store.profile_for_user("alice").await.unwrap().len(), 1);
    }

    #[test]
    fn descriptor_byte_fidelity() {
        let mut values = vec![0.5f32; DIM];
        values[0] = 0.0;
        values[1] = -0.0;
        values[2] = f32::MIN_POSITIVE;
        values[3] = std::f32::consts::PI;

        let recovered = bytes_to_descriptor(&descriptor_to_bytes(&values), DIM).unwrap();
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[test]
    fn decoding_rejects_non_finite_and_wrong_length() {
        let mut values = vec![0.5f32; DIM];
        values[42] = f32::NAN;
        let err = bytes_to_descriptor(&descriptor_to_bytes(&values), DIM).unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue));

        let err = bytes_to_descriptor(&[0u8; 100], DIM).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(100)));
    }

    #[tokio::test]
    async fn blobs_are_not_plaintext() {
        let store = memory_store().await;
        let values = descriptor(0.25);
        let blob = store.encrypt_descriptor(values.values()).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + DIM * 4 + 16);
        assert_ne!(&blob[NONCE_LEN..NONCE_LEN + DIM * 4], descriptor_to_bytes(values.values()).as_slice());
    }

    #[tokio::test]
    async fn wrong_key_fails() {
        let store1 = DescriptorStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
            dim: DIM,
        };
        let store2 = DescriptorStore {
            enc_key: [2u8; 32],
            ..store1.clone()
        };

        let blob = store1.encrypt_descriptor(descriptor(0.0).values()).unwrap();
        assert!(matches!(
            store2.decrypt_descriptor(&blob),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn key_file_is_created_once_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("vigild-key-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join(".key");

        let first = load_or_generate_key(&key_path).unwrap();
        let second = load_or_generate_key(&key_path).unwrap();
        assert_eq!(first, second);

        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
