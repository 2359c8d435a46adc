//! Conversation Context
//!
//! Short-lived per-user message history, kept in memory only. Each user has
//! at most one history, stored as a JSON array of role-tagged turns and
//! replaced wholesale on every exchange. A history expires after the
//! inactivity window measured from its last write.

use crate::cache::ExpiringStore;
use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum messages to keep per conversation (rolling window)
pub const MAX_MESSAGES_PER_CONVERSATION: usize = 50;

/// Opening system turn of every fresh history
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Fresh history holding only the system prompt
pub fn new_history() -> Vec<ChatMessage> {
    vec![ChatMessage::system(SYSTEM_PROMPT)]
}

/// Parse a stored history. Missing or malformed input starts a fresh one.
pub fn decode_history(raw: Option<&str>) -> Vec<ChatMessage> {
    let Some(raw) = raw else {
        return new_history();
    };

    match serde_json::from_str::<Vec<ChatMessage>>(raw) {
        Ok(history) if !history.is_empty() => history,
        Ok(_) => new_history(),
        Err(e) => {
            warn!("Discarding malformed conversation history: {}", e);
            new_history()
        }
    }
}

pub fn encode_history(history: &[ChatMessage]) -> String {
    // A Vec of plain structs cannot fail to serialize
    serde_json::to_string(history).unwrap_or_else(|_| "[]".to_string())
}

/// Keep leading system turns plus the most recent messages, `max` in total
pub fn trim_history(history: &mut Vec<ChatMessage>, max: usize) {
    if history.len() <= max {
        return;
    }

    let pinned = history
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
        .min(max);
    let excess = history.len() - max;
    history.drain(pinned..pinned + excess);
}

/// Per-user history store with inactivity expiry
pub struct ConversationCache {
    store: Arc<ExpiringStore<String>>,
    ttl: Duration,
}

impl ConversationCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(ExpiringStore::new("conversations").with_clock(clock)),
            ttl,
        }
    }

    /// Store key for a user
    pub fn user_key(user_id: i64) -> String {
        format!("user_{}", user_id)
    }

    pub async fn get(&self, user_key: &str) -> Option<String> {
        self.store.get(user_key).await
    }

    /// Replace the history and restart the inactivity timer
    pub async fn set(&self, user_key: &str, history: String) {
        self.store.put(user_key, history, self.ttl).await;
        debug!("Stored conversation for {}", user_key);
    }

    pub async fn clear(&self, user_key: &str) {
        self.store.delete(user_key).await;
    }

    pub async fn sweep(&self) -> usize {
        self.store.sweep().await
    }

    pub fn spawn_sweeper(&self, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.store.spawn_sweeper(interval, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const THIRTY_MINUTES: Duration = Duration::from_secs(30 * 60);

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = ConversationCache::new(THIRTY_MINUTES, ManualClock::starting_now());
        let key = ConversationCache::user_key(12345);
        assert_eq!(key, "user_12345");

        cache.set(&key, "[]".to_string()).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_inactivity_expiry_resets_on_set() {
        let clock = ManualClock::starting_now();
        let cache = ConversationCache::new(THIRTY_MINUTES, clock.clone());
        let key = ConversationCache::user_key(1);

        cache.set(&key, "a".to_string()).await;
        clock.advance(Duration::from_secs(20 * 60));
        cache.set(&key, "b".to_string()).await;
        clock.advance(Duration::from_secs(20 * 60));
        assert_eq!(cache.get(&key).await.as_deref(), Some("b"));

        clock.advance(Duration::from_secs(10 * 60));
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_one_history_per_user() {
        let cache = ConversationCache::new(THIRTY_MINUTES, ManualClock::starting_now());
        cache.set("user_1", "first".to_string()).await;
        cache.set("user_1", "second".to_string()).await;
        cache.set("user_2", "other".to_string()).await;

        assert_eq!(cache.get("user_1").await.as_deref(), Some("second"));
        assert_eq!(cache.get("user_2").await.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ConversationCache::new(THIRTY_MINUTES, ManualClock::starting_now());
        cache.set("user_1", "x".to_string()).await;
        cache.clear("user_1").await;
        cache.clear("user_1").await;
        assert!(cache.get("user_1").await.is_none());
    }

    #[test]
    fn test_decode_history_fallbacks() {
        assert_eq!(decode_history(None), new_history());
        assert_eq!(decode_history(Some("{not json")), new_history());
        assert_eq!(decode_history(Some("[]")), new_history());
    }

    #[test]
    fn test_history_roundtrip_uses_role_names() {
        let history = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user("Hello, my name is Max"),
            ChatMessage::assistant("Nice to meet you, Max!"),
        ];
        let raw = encode_history(&history);
        assert!(raw.contains("\"role\":\"assistant\""));
        assert_eq!(decode_history(Some(&raw)), history);
    }

    #[test]
    fn test_trim_keeps_system_prompt() {
        let mut history = new_history();
        for i in 0..5 {
            history.push(ChatMessage::user(format!("Message {}", i)));
        }

        trim_history(&mut history, 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1].content, "Message 3");
        assert_eq!(history[2].content, "Message 4");
    }

    #[test]
    fn test_trim_under_limit_is_noop() {
        let mut history = new_history();
        history.push(ChatMessage::user("hi"));
        trim_history(&mut history, MAX_MESSAGES_PER_CONVERSATION);
        assert_eq!(history.len(), 2);
    }
}
