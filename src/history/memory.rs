use async_trait::async_trait;
use chrono::Utc;
use std::collections::{ HashMap, VecDeque };
use std::sync::{ Mutex, MutexGuard, PoisonError };
use crate::history::{ HistoryError, HistoryStore };
use crate::models::chat::{ ChatMessage, Conversation, Role };

/// Process-local store. Nothing survives a restart.
pub struct MemoryHistoryStore {
    conversations: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
    limit: usize,
}

impl MemoryHistoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ChatMessage>>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), HistoryError> {
        let mut conversations = self.lock();
        let messages = conversations.entry(conversation_id.to_string()).or_default();
        let now = Utc::now().timestamp_millis();
        let timestamp = messages.back().map_or(now, |last| last.timestamp.max(now));
        messages.push_back(ChatMessage {
            role,
            content: content.to_string(),
            timestamp,
        });
        while messages.len() > self.limit {
            messages.pop_front();
        }
        Ok(())
    }

    async fn read(&self, conversation_id: &str) -> Result<Conversation, HistoryError> {
        let conversations = self.lock();
        let messages = conversations
            .get(conversation_id)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default();
        Ok(Conversation {
            id: conversation_id.to_string(),
            messages,
        })
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), HistoryError> {
        self.lock().remove(conversation_id);
        Ok(())
    }

    fn limit(&self) -> usize {
        self.limit
    }
}
