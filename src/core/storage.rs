use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A string key/value store with `localStorage`/`sessionStorage` semantics.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory storage used by the virtual DOM and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.items().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.items().remove(key);
    }
}
