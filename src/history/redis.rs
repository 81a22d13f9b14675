use async_trait::async_trait;
use crate::models::chat::{ ChatMessage, Conversation, Role };
use crate::history::{ HistoryError, HistoryStore };
use chrono::Utc;
use log::debug;
use redis::{ Client, AsyncCommands, Script };
use serde::{ Serialize, Deserialize };

// KEYS[1] list, ARGV: now millis, role, content, limit. The timestamp never
// goes below the last stored entry's, and push+trim run as one script.
const APPEND_SCRIPT: &str =
    r#"
local ts = tonumber(ARGV[1])
local last = redis.call('LINDEX', KEYS[1], -1)
if last then
    local ok, prev = pcall(cjson.decode, last)
    if ok and type(prev) == 'table' then
        local prev_ts = tonumber(prev.timestamp)
        if prev_ts and prev_ts > ts then
            ts = prev_ts
        end
    end
end
local len = redis.call('RPUSH', KEYS[1], cjson.encode({ role = ARGV[2], content = ARGV[3], timestamp = ts }))
redis.call('LTRIM', KEYS[1], -tonumber(ARGV[4]), -1)
return len
"#;

#[derive(Serialize, Deserialize)]
struct StoredMessage {
    role: Role,
    content: String,
    timestamp: i64,
}

/// One Redis list per conversation; list position is the write order.
pub struct RedisHistoryStore {
    client: Client,
    append_script: Script,
    key_prefix: String,
    limit: usize,
}

impl RedisHistoryStore {
    pub fn new(host: &str, key_prefix: String, limit: usize) -> Result<Self, HistoryError> {
        Ok(Self {
            client: Client::open(host)?,
            append_script: Script::new(APPEND_SCRIPT),
            key_prefix,
            limit,
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.key_prefix, conversation_id)
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;
        let key = self.key(conversation_id);

        let len: i64 = self.append_script
            .key(&key)
            .arg(Utc::now().timestamp_millis())
            .arg(role.as_str())
            .arg(content)
            .arg(self.limit)
            .invoke_async(&mut conn).await?;
        debug!("Appended {} message to '{}' (list length before trim: {})", role, key, len);
        Ok(())
    }

    async fn read(&self, conversation_id: &str) -> Result<Conversation, HistoryError> {
        let mut conn = self.get_connection().await?;
        let key = self.key(conversation_id);
        let json_entries: Vec<String> = conn.lrange(&key, 0, -1).await?;

        let messages = json_entries
            .iter()
            .map(|entry| {
                serde_json
                    ::from_str::<StoredMessage>(entry)
                    .map(|msg| ChatMessage {
                        role: msg.role,
                        content: msg.content,
                        timestamp: msg.timestamp,
                    })
                    .map_err(|e| HistoryError::Corrupt {
                        conversation_id: conversation_id.to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Conversation {
            id: conversation_id.to_string(),
            messages,
        })
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;
        let _: i64 = conn.del(self.key(conversation_id)).await?;
        Ok(())
    }

    fn limit(&self) -> usize {
        self.limit
    }
}
