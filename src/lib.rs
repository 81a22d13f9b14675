pub mod agent;
pub mod bot;
pub mod cli;
pub mod command;
pub mod config;
pub mod history;
pub mod llm;
pub mod models;
pub mod telegram;

use agent::{ ConversationHandler, RetryPolicy };
use bot::Bot;
use cli::Args;
use config::prompt::load_prompts_or_default;
use history::initialize_history_store;
use llm::chat::{ new_client as new_chat_client, CompletionOptions };
use llm::LlmConfig;
use log::info;
use std::error::Error;
use std::num::NonZeroU32;
use std::sync::Arc;
use telegram::TelegramClient;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    args.validate()?;

    info!("--- Core Configuration ---");
    info!("Telegram API: {}", args.telegram_api_url);
    info!("Poll Timeout: {}s", args.telegram_poll_timeout);
    info!("History Store Type: {}", args.history_type);
    info!("History Store Host: {}", args.history_host);
    info!("History Limit: {}", args.history_limit);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Max Tokens: {}", args.chat_max_tokens);
    info!("Temperature: {}", args.chat_temperature);
    info!("Request Timeout: {:?}", args.request_timeout());
    info!("Retry Attempts: {}", args.retry_attempts);
    info!("Retry Base Delay: {:?}", args.retry_base_delay());
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("-------------------------");

    let chat_config = LlmConfig {
        llm_type: args.chat_llm_type
            .parse()
            .map_err(|e| format!("Invalid chat LLM type: {}", e))?,
        api_key: Some(args.chat_api_key.clone()),
        completion_model: args.chat_model.clone(),
        base_url: args.chat_base_url.clone(),
        request_timeout: args.request_timeout(),
    };
    let chat_client = new_chat_client(&chat_config)?;
    info!(
        "Chat client configured: Type={}, Model={}, BaseURL={}",
        chat_client.get_llm_type(),
        chat_client.get_model(),
        chat_client.get_base_url()
    );

    let history_store = initialize_history_store(&args)?;
    let prompt_config = load_prompts_or_default(args.prompts_path.as_deref())?;

    let options = CompletionOptions {
        model: chat_client.get_model(),
        max_tokens: args.chat_max_tokens,
        temperature: args.chat_temperature,
    };
    let retry = RetryPolicy {
        max_attempts: args.retry_attempts,
        base_delay: args.retry_base_delay(),
    };
    let handler = Arc::new(
        ConversationHandler::new(history_store, chat_client, prompt_config, options, retry)
    );

    let platform = Arc::new(
        TelegramClient::new(
            &args.telegram_api_url,
            args.telegram_bot_token.clone(),
            args.telegram_poll_timeout
        )?
    );
    let send_rate = NonZeroU32::new(args.telegram_send_rate).ok_or(
        "TELEGRAM_SEND_RATE must be at least 1"
    )?;

    info!("✅ Bot started and ready");
    Bot::new(platform, handler, send_rate).run().await
}
