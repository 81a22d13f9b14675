mod memory;
mod redis;
use async_trait::async_trait;
use log::info;
use thiserror::Error;
use crate::cli::Args;
use std::sync::Arc;
use crate::models::chat::{ Conversation, Role };

pub use self::memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("Corrupt history entry in '{conversation_id}': {reason}")]
    Corrupt {
        conversation_id: String,
        reason: String,
    },
    #[error("Unsupported history store type: {0}")]
    UnsupportedType(String),
}

/// Ordered per-conversation log, capped at a fixed number of newest entries.
///
/// `append` inserts and truncates as one atomic unit for a given conversation,
/// so concurrent writers can never leave more or fewer than the newest
/// `limit()` entries behind.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), HistoryError>;

    /// Oldest first. Unknown conversations yield an empty list.
    async fn read(&self, conversation_id: &str) -> Result<Conversation, HistoryError>;

    /// Idempotent.
    async fn clear(&self, conversation_id: &str) -> Result<(), HistoryError>;

    fn limit(&self) -> usize;
}

pub fn create_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    let limit = args.history_limit.max(1);
    match args.history_type.to_lowercase().as_str() {
        "redis" => {
            let store = RedisHistoryStore::new(
                &args.history_host,
                args.history_redis_prefix.clone(),
                limit
            )?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryHistoryStore::new(limit))),
        _ => Err(HistoryError::UnsupportedType(args.history_type.clone())),
    }
}

pub fn initialize_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    let store = create_history_store(args)?;
    info!("Keeping the last {} messages per chat", store.limit());
    Ok(store)
}
