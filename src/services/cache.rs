use crate::core::io::Storage;
use crate::core::state::Emotion;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const EXTENSION: &str = "audio";

/// Persistent audio cache keyed on (normalized text, emotion).
///
/// Entries are content-addressed, so anything found on disk is valid for
/// its key; an unreadable or empty file is treated as a miss.
pub struct AudioCache {
    storage: Arc<dyn Storage>,
    folder: String,
}

impl AudioCache {
    pub fn new(storage: Arc<dyn Storage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into().trim_end_matches('/').to_string(),
        }
    }

    /// Collapses whitespace runs so cosmetic differences share an entry.
    pub fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn key(text: &str, emotion: Emotion) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize(text).as_bytes());
        hasher.update(b"\x1f");
        hasher.update(emotion.as_str().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn path_for(&self, key: &str) -> String {
        format!("{}/{}/{}.{}", self.folder, &key[..2], key, EXTENSION)
    }

    pub async fn lookup(&self, text: &str, emotion: Emotion) -> Option<Vec<u8>> {
        let path = self.path_for(&Self::key(text, emotion));
        match self.storage.exists(&path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Cache check failed for {}: {}", path, e);
                return None;
            }
        }
        match self.storage.read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                debug!("Cache hit: {}", path);
                Some(bytes)
            }
            Ok(_) => {
                warn!("Ignoring empty cache entry {}", path);
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path, e);
                None
            }
        }
    }

    /// Best effort; a failed write only costs a future cache miss.
    pub async fn store(&self, text: &str, emotion: Emotion, audio: &[u8]) {
        if audio.is_empty() {
            return;
        }
        let path = self.path_for(&Self::key(text, emotion));
        if let Err(e) = self.storage.write(&path, audio).await {
            warn!("Failed to write cache entry {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn cache_in(dir: &std::path::Path) -> AudioCache {
        AudioCache::new(
            Arc::new(NativeStorage::new()),
            dir.join("audio").to_string_lossy().to_string(),
        )
    }

    #[test]
    fn test_key_depends_on_text_and_emotion() {
        let a = AudioCache::key("小貓 出門了", Emotion::Happy);
        assert_eq!(a.len(), 64);
        assert_eq!(a, AudioCache::key("  小貓\n出門了 ", Emotion::Happy));
        assert_ne!(a, AudioCache::key("小貓 出門了", Emotion::Sad));
        assert_ne!(a, AudioCache::key("小貓出門了", Emotion::Happy));
    }

    #[tokio::test]
    async fn test_entries_survive_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        cache_in(dir.path())
            .store("hello", Emotion::Neutral, b"RIFFdata")
            .await;

        let reopened = cache_in(dir.path());
        assert_eq!(
            reopened.lookup("hello", Emotion::Neutral).await,
            Some(b"RIFFdata".to_vec())
        );
        assert_eq!(reopened.lookup("hello", Emotion::Angry).await, None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let key = AudioCache::key("page", Emotion::Sad);
        let path = cache.path_for(&key);
        std::fs::create_dir_all(std::path::Path::new(&path).parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();
        assert_eq!(cache.lookup("page", Emotion::Sad).await, None);

        // A directory where the file should be cannot be read either.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(&path).unwrap();
        assert_eq!(cache.lookup("page", Emotion::Sad).await, None);
    }

    #[tokio::test]
    async fn test_empty_audio_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.store("x", Emotion::Happy, b"").await;
        assert!(!dir.path().join("audio").exists());
    }
}
