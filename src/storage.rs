use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::session::{Role, Turn};

pub const DEFAULT_HISTORY_PAIRS: usize = 5;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Per-session conversation history, injected into the relay.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Stored turns for `session_id` in insertion order. Unknown sessions yield an empty history.
    async fn get_history(&self, session_id: &str) -> Vec<Turn>;
    /// Appends `turns` in order and trims the session back to its history window.
    async fn append_turns(&self, session_id: &str, turns: Vec<Turn>);
    async fn session_count(&self) -> usize;
}

/// Capacity-bounded store; the least recently used session is evicted when full.
pub struct InMemoryConversationStore {
    sessions: Mutex<LruCache<String, Vec<Turn>>>,
    max_pairs: usize,
}

impl InMemoryConversationStore {
    pub fn new(max_pairs: usize, max_sessions: usize) -> Self {
        let capacity = NonZeroUsize::new(max_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            max_pairs,
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self { Self::new(DEFAULT_HISTORY_PAIRS, DEFAULT_MAX_SESSIONS) }
}

/// Keeps at most `max_pairs` user/assistant pairs, dropping from the front two at a time.
/// A window that would start on a non-user turn is advanced past it.
pub(crate) fn truncate_in_pairs(turns: &mut Vec<Turn>, max_pairs: usize) {
    let cap = max_pairs.saturating_mul(2);
    if turns.len() > cap {
        let mut excess = turns.len() - cap;
        if excess % 2 == 1 {
            excess += 1;
        }
        turns.drain(..excess.min(turns.len()));
    }
    let orphaned = turns.iter().take_while(|t| t.role != Role::User).count();
    if orphaned > 0 {
        turns.drain(..orphaned);
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_history(&self, session_id: &str) -> Vec<Turn> {
        let mut sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    async fn append_turns(&self, session_id: &str, turns: Vec<Turn>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(history) = sessions.get_mut(session_id) {
            history.extend(turns);
            truncate_in_pairs(history, self.max_pairs);
            return;
        }
        let mut history = turns;
        truncate_in_pairs(&mut history, self.max_pairs);
        if let Some((evicted, _)) = sessions.push(session_id.to_string(), history) {
            tracing::debug!(session = %evicted, "evicted least recently used conversation");
        }
    }

    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
