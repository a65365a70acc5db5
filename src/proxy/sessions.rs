//! In-memory map of API key → provider → tab session. Last write wins.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A tab opened on the LLM service on behalf of one API key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabSession {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub created_at: Value,
    pub provider_name: String,
}

type Sessions = HashMap<String, HashMap<String, TabSession>>;

#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<Sessions>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str, provider: &str) -> Option<TabSession> {
        self.lock().get(key).and_then(|tabs| tabs.get(provider)).cloned()
    }

    pub fn contains(&self, key: &str, provider: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|tabs| tabs.contains_key(provider))
    }

    pub fn insert(&self, key: &str, provider: &str, session: TabSession) {
        self.lock()
            .entry(key.to_string())
            .or_default()
            .insert(provider.to_string(), session);
    }

    pub fn remove(&self, key: &str, provider: &str) -> Option<TabSession> {
        let mut sessions = self.lock();
        let tabs = sessions.get_mut(key)?;
        let removed = tabs.remove(provider);
        if tabs.is_empty() {
            sessions.remove(key);
        }
        removed
    }

    /// Records the conversation id of an existing tab. Returns `false` if there is no such tab.
    pub fn set_conversation(&self, key: &str, provider: &str, conversation_id: &str) -> bool {
        match self.lock().get_mut(key).and_then(|tabs| tabs.get_mut(provider)) {
            Some(session) => {
                session.conversation_id = Some(conversation_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Sorted copy of the whole map.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, TabSession>> {
        self.lock()
            .iter()
            .map(|(key, tabs)| {
                let tabs = tabs.iter().map(|(p, s)| (p.clone(), s.clone())).collect();
                (key.clone(), tabs)
            })
            .collect()
    }

    /// Number of keys with at least one tab.
    pub fn active_users(&self) -> usize {
        self.lock().values().filter(|tabs| !tabs.is_empty()).count()
    }

    pub fn total_sessions(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}
