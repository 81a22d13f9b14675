use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Telegram Args ---
    /// Bot token issued by @BotFather.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: String,

    /// Base URL of the Telegram Bot API (override for a local Bot API server).
    #[arg(long, env = "TELEGRAM_API_URL", default_value = "https://api.telegram.org")]
    pub telegram_api_url: String,

    /// Long polling timeout in seconds for getUpdates.
    #[arg(long, env = "TELEGRAM_POLL_TIMEOUT", default_value = "30")]
    pub telegram_poll_timeout: u64,

    /// Maximum outgoing messages per second across all chats.
    #[arg(long, env = "TELEGRAM_SEND_RATE", default_value = "25")]
    pub telegram_send_rate: u32,

    // --- History Store Args ---
    /// History chat store type (redis, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "redis")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "history:")]
    pub history_redis_prefix: String,

    /// Number of most recent messages kept per chat.
    #[arg(long, env = "HISTORY_LIMIT", default_value = "10")]
    pub history_limit: usize,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (groq, openai)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "groq")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., https://api.groq.com/openai/v1)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider.
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., llama-3.1-8b-instant, gpt-4o-mini)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Upper bound on generated tokens per reply.
    #[arg(long, env = "CHAT_MAX_TOKENS", default_value = "256")]
    pub chat_max_tokens: u32,

    /// Sampling temperature.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub chat_temperature: f32,

    /// Network timeout in seconds for a single completion request.
    #[arg(long, env = "CHAT_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Total completion attempts per message when rate limited.
    #[arg(long, env = "CHAT_RETRY_ATTEMPTS", default_value = "3")]
    pub retry_attempts: u32,

    /// Backoff before the second attempt in milliseconds; doubles after each further attempt.
    #[arg(long, env = "CHAT_RETRY_BASE_DELAY_MS", default_value = "1000")]
    pub retry_base_delay_ms: u64,

    // --- General App Args ---
    /// Optional path to a JSON file overriding the system prompt and bot replies.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,
}

impl Args {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Rejects blank credentials and zero-valued limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.telegram_bot_token.trim().is_empty() {
            return Err("TELEGRAM_BOT_TOKEN must be set".to_string());
        }
        if self.chat_api_key.trim().is_empty() {
            return Err("GROQ_API_KEY must be set".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("CHAT_RETRY_ATTEMPTS must be at least 1".to_string());
        }
        if self.telegram_send_rate == 0 {
            return Err("TELEGRAM_SEND_RATE must be at least 1".to_string());
        }
        Ok(())
    }
}
