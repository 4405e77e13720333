use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::ChatStore;
use super::atomic::{staging_path, write_json_atomic};
use super::error::{DecodeChatsSnafu, ReadFileSnafu, RemoveFileSnafu, StorageResult};
use super::types::StoredChat;

pub const APP_DIRECTORY_NAME: &str = "lama";
pub const CHATS_DIRECTORY_NAME: &str = "SavedChats";
pub const CHATS_FILE_NAME: &str = "chats.json";

/// Keeps every saved chat in one pretty-printed JSON array.
///
/// Writes are staged next to the file and renamed over it, so a crash mid-write leaves
/// the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn default_chats_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(APP_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lama"))
            .join(CHATS_DIRECTORY_NAME)
    }

    pub fn default_path() -> PathBuf {
        Self::default_chats_dir().join(CHATS_FILE_NAME)
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(directory: impl AsRef<Path>) -> Self {
        Self::new(directory.as_ref().join(CHATS_FILE_NAME))
    }

    pub fn open_default() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the non-empty chats and returns how many were stored.
    pub fn try_save(&self, chats: &[StoredChat]) -> StorageResult<usize> {
        let stored = chats
            .iter()
            .filter(|chat| !chat.is_empty())
            .collect::<Vec<_>>();

        write_json_atomic(&self.path, &stored)?;
        tracing::debug!(path = ?self.path, chat_count = stored.len(), "saved chats");
        Ok(stored.len())
    }

    /// A missing file is an empty collection, not an error.
    pub fn try_load(&self) -> StorageResult<Vec<StoredChat>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read(&self.path).context(ReadFileSnafu {
            stage: "read-chats-file",
            path: self.path.clone(),
        })?;

        serde_json::from_slice(&content).context(DecodeChatsSnafu {
            stage: "decode-chats-json",
            path: self.path.clone(),
        })
    }

    pub fn try_delete_all(&self) -> StorageResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context(RemoveFileSnafu {
                stage: "remove-chats-file",
                path: self.path.clone(),
            }),
        }
    }
}

impl ChatStore for JsonFileStore {
    fn save(&self, chats: &[StoredChat]) {
        if let Err(error) = self.try_save(chats) {
            tracing::warn!(path = ?self.path, error = %error, "failed to save chats");
        }
    }

    fn load(&self) -> Vec<StoredChat> {
        match self.try_load() {
            Ok(chats) => chats,
            Err(error) => {
                tracing::warn!(
                    path = ?self.path,
                    error = %error,
                    "failed to load chats; starting empty"
                );
                Vec::new()
            }
        }
    }

    fn delete_all(&self) {
        if let Err(error) = self.try_delete_all() {
            tracing::warn!(path = ?self.path, error = %error, "failed to delete saved chats");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::ids::{MessageId, SessionId};
    use crate::types::{StoredMessage, StoredRole, WebSource};

    fn chat(model: &str, contents: &[(StoredRole, &str)]) -> StoredChat {
        StoredChat {
            id: SessionId::new_v4(),
            model: model.to_string(),
            messages: contents
                .iter()
                .map(|(role, content)| StoredMessage {
                    id: MessageId::new_v4(),
                    role: *role,
                    content: content.to_string(),
                    sources: Vec::new(),
                })
                .collect(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("date"),
        }
    }

    #[test]
    fn round_trip_keeps_non_empty_chats_in_order() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::in_dir(dir.path().join(CHATS_DIRECTORY_NAME));

        let mut first = chat("m1", &[(StoredRole::User, "Hello"), (StoredRole::Assistant, "Hi")]);
        first.messages[1].sources.push(WebSource {
            title: "Example".to_string(),
            url: "https://example.com".to_string(),
        });
        let empty = chat("m1", &[]);
        let second = chat("m2", &[(StoredRole::User, "Second")]);

        let written = store
            .try_save(&[first.clone(), empty.clone(), second.clone()])
            .expect("save");
        assert_eq!(written, 2);

        let loaded = store.load();
        assert_eq!(loaded, vec![first, second]);
        assert!(loaded.iter().all(|chat| chat.id != empty.id));
        assert!(!staging_path(store.path()).exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::in_dir(dir.path());
        assert!(store.try_load().expect("load").is_empty());
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(store.path(), b"[{\"id\": 42").expect("write garbage");

        assert!(store.try_load().is_err());
        assert!(store.load().is_empty());
    }

    #[test]
    fn failed_save_keeps_previous_snapshot() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::in_dir(dir.path());
        let saved = chat("m1", &[(StoredRole::User, "keep me")]);
        store.save(std::slice::from_ref(&saved));

        // A directory squatting on the staging path makes the next write fail.
        std::fs::create_dir(staging_path(store.path())).expect("block staging path");
        store.save(&[chat("m2", &[(StoredRole::User, "lost")])]);

        assert_eq!(store.load(), vec![saved]);
    }

    #[test]
    fn delete_all_removes_file_and_tolerates_absence() {
        let dir = TempDir::new().expect("temp dir");
        let store = JsonFileStore::in_dir(dir.path());
        store.save(&[chat("m1", &[(StoredRole::User, "Hello")])]);
        assert!(store.path().exists());

        store.delete_all();
        assert!(!store.path().exists());
        assert!(store.try_delete_all().is_ok());
    }
}
