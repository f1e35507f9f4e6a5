//! Opaque storage for attachment bytes, addressed by key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest;

/// `{user}/{digest}`: the base64url user id, then the base64url SHA-256 of
/// the length-prefixed `(user, message, part)` triple. Distinct triples never
/// share a key, whatever characters the provider ids contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

/// Stands in for an empty user id. A one-character string is never a
/// base64 encoding, so it cannot collide with a real user segment.
const EMPTY_SEGMENT: &str = "_";

impl BlobKey {
    pub fn attachment(user_id: &str, message_id: &str, part_key: &str) -> Self {
        let user = if user_id.is_empty() {
            EMPTY_SEGMENT.to_string()
        } else {
            URL_SAFE_NO_PAD.encode(user_id)
        };

        let mut context = digest::Context::new(&digest::SHA256);
        for segment in [user_id, message_id, part_key] {
            context.update(&(segment.len() as u64).to_be_bytes());
            context.update(segment.as_bytes());
        }
        let digest = URL_SAFE_NO_PAD.encode(context.finish());

        Self(format!("{user}/{digest}"))
    }

    /// Rebuilds a key read back from the attachments table.
    pub fn from_stored(raw: &str) -> Result<Self> {
        let valid = match raw.split_once('/') {
            Some((user, digest)) => {
                is_key_segment(user) && is_key_segment(digest) && digest.len() == DIGEST_CHARS
            }
            None => false,
        };
        if !valid {
            return Err(anyhow!("malformed blob key '{raw}'"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or((EMPTY_SEGMENT, &self.0))
    }
}

/// Unpadded base64url length of a SHA-256 digest.
const DIGEST_CHARS: usize = 43;

fn is_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

pub trait BlobStore: Send + Sync {
    /// Stores `data`, replacing any previous content under the key.
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()>;

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &BlobKey) -> Result<bool>;

    fn delete(&self, key: &BlobKey) -> Result<()>;
}

/// Directory layout:
/// ```text
/// blobs/
///   {user}/
///     {shard}/
///       {digest}.att
/// ```
/// where `shard` is the first two characters of the digest.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("create blob directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        let (user, digest) = key.segments();
        let shard = digest.get(..2).unwrap_or("xx");
        self.root
            .join(user)
            .join(shard)
            .join(format!("{digest}.att"))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create blob shard {}", parent.display()))?;
        }

        // Write to a temp file then rename so readers never see a partial blob.
        let temp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, data)
            .with_context(|| format!("write blob {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("move blob into place at {}", path.display()))?;
        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).with_context(|| format!("read blob {}", path.display())),
        }
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blob_path(key).exists())
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("delete blob {}", path.display()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobKey, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<BlobKey, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        self.lock()?.insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
