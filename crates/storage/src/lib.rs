pub mod atomic;
pub mod error;
pub mod ids;
pub mod json_file;
pub mod memory;
pub mod types;

pub use atomic::{staging_path, write_json_atomic};
pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use json_file::{CHATS_DIRECTORY_NAME, CHATS_FILE_NAME, JsonFileStore};
pub use memory::MemoryChatStore;
pub use types::{StoredChat, StoredMessage, StoredRole, WebSource};

/// Durable home of saved chats.
///
/// Implementations swallow their own failures: `load` degrades to an empty list and a
/// failed `save` leaves the previous snapshot in place. Empty chats are never written.
pub trait ChatStore: Send + Sync {
    fn save(&self, chats: &[StoredChat]);
    fn load(&self) -> Vec<StoredChat>;
    fn delete_all(&self);
}
