use std::sync::{Mutex, MutexGuard};

use super::ChatStore;
use super::types::StoredChat;

#[derive(Debug, Default)]
struct MemoryState {
    chats: Vec<StoredChat>,
    save_count: usize,
}

/// In-process [`ChatStore`] that also counts writes.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chats(chats: Vec<StoredChat>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                chats,
                save_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save_count(&self) -> usize {
        self.lock().save_count
    }

    pub fn chats(&self) -> Vec<StoredChat> {
        self.lock().chats.clone()
    }
}

impl ChatStore for MemoryChatStore {
    fn save(&self, chats: &[StoredChat]) {
        let mut state = self.lock();
        state.chats = chats.iter().filter(|chat| !chat.is_empty()).cloned().collect();
        state.save_count += 1;
    }

    fn load(&self) -> Vec<StoredChat> {
        self.lock().chats.clone()
    }

    fn delete_all(&self) {
        self.lock().chats.clear();
    }
}
