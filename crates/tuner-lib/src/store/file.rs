//! Directory-backed model store

use super::{check_revision, decode_blob, encode_blob, stamped, ModelKey, ModelStore};
use crate::error::StoreError;
use crate::policy::PolicyState;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Stores each model as `<dir>/<key>`
///
/// Saves go through a temp file that is synced and renamed over the
/// target, so a concurrent `load` sees either the old or the new blob.
pub struct FileModelStore {
    dir: PathBuf,
    /// Serializes revision check and replace within this process
    write_lock: Mutex<()>,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are relative paths under the root; a `/` in a key nests it
    /// in a subdirectory
    fn path_for(&self, key: &ModelKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    async fn read_blob(&self, key: &ModelKey) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_blob(&self, path: &Path, blob: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(path.parent().unwrap_or(&self.dir)).await?;

        // sibling of the target named after the full file name, so keys
        // differing only in extension never share a temp file
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(blob).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ModelStore for FileModelStore {
    async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError> {
        let blob = self
            .read_blob(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        decode_blob(key, &blob)
    }

    async fn save(&self, key: &ModelKey, state: &PolicyState) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        let stored = match self.read_blob(key).await? {
            Some(blob) => Some(decode_blob(key, &blob)?.revision),
            None => None,
        };
        let revision = check_revision(key, stored, state.revision)?;

        let blob = encode_blob(&stamped(state, revision))?;
        let path = self.path_for(key);
        self.write_blob(&path, &blob).await?;

        debug!(key = %key, revision = revision, bytes = blob.len(), "Saved model to {:?}", path);
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionSpace;
    use crate::policy::PolicyConfig;
    use tempfile::TempDir;

    fn state() -> PolicyState {
        let config = PolicyConfig::new(
            ActionSpace::new(vec![128, 256, 512]).unwrap(),
            vec!["payload_size".to_string()],
        );
        PolicyState::fresh(&config)
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path());
        let err = store.load(&ModelKey::from_raw("absent.model")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path().join("models"));
        let key = ModelKey::new("resize", "exp1");

        let revision = store.save(&key, &state()).await.unwrap();
        assert_eq!(revision, 1);
        assert!(!dir.path().join("models").join("resize_exp1.model.tmp").exists());

        let loaded = store.load(&key).await.unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.scorers, state().scorers);
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path());
        let key = ModelKey::new("resize", "exp1");

        let base = state();
        store.save(&key, &base).await.unwrap();

        // second writer still holds revision 0
        let err = store.save(&key, &base).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));

        let mut current = store.load(&key).await.unwrap();
        current.updates = 5;
        assert_eq!(store.save(&key, &current).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_keys_sharing_a_stem_stay_separate() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path());
        let spare = ModelKey::from_raw("resize.tmp");
        let model = ModelKey::from_raw("resize.model");

        store.save(&spare, &state()).await.unwrap();
        store.save(&model, &state()).await.unwrap();

        assert_eq!(store.load(&spare).await.unwrap().revision, 1);
        assert_eq!(store.load(&model).await.unwrap().revision, 1);
        assert!(!dir.path().join("resize.model.tmp").exists());
    }

    #[tokio::test]
    async fn test_bucket_prefix_nests_in_subdirectory() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path());
        let key = ModelKey::from_raw("models/decompress_exp.model");

        store.save(&key, &state()).await.unwrap();
        assert!(dir.path().join("models").join("decompress_exp.model").is_file());
    }

    #[tokio::test]
    async fn test_corrupt_file_detected() {
        let dir = TempDir::new().unwrap();
        let store = FileModelStore::new(dir.path());
        let key = ModelKey::from_raw("broken.model");
        std::fs::write(dir.path().join("broken.model"), b"{\"format\":1}\ngarbage").unwrap();

        let err = store.load(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
