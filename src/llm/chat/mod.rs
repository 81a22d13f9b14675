pub mod groq;
pub mod openai;

use async_trait::async_trait;
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, StatusCode, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION, RETRY_AFTER } };
use serde::{ Deserialize, Serialize };
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use super::{ LlmConfig, LlmType };
use self::groq::GroqChatClient;
use self::openai::OpenAIChatClient;
use crate::models::chat::PromptMessage;

/// Failure of a single completion request, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion service is rate limiting requests")]
    RateLimited {
        retry_after: Option<Duration>,
    },
    #[error("Completion service error: {0}")]
    Service(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Single-shot chat completion. Implementations never retry; callers own the
/// retry policy.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions
    ) -> Result<String, CompletionError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> String;
    fn get_llm_type(&self) -> LlmType;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, CompletionError> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Groq => {
            let specific_client = GroqChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub(crate) fn build_http_client(
    api_key: &str,
    timeout: Duration
) -> Result<HttpClient, CompletionError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
        CompletionError::Service(format!("Invalid API key format: {}", e))
    )?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    HttpClient::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| CompletionError::Service(format!("Failed to build HTTP client: {}", e)))
}

/// POSTs an OpenAI-style chat completion body and classifies the outcome.
pub(crate) async fn post_chat_completion<T: Serialize + ?Sized>(
    http: &HttpClient,
    url: &str,
    body: &T,
    provider: &str
) -> Result<String, CompletionError> {
    let resp = http
        .post(url)
        .json(body)
        .send().await
        .map_err(|e| CompletionError::Service(format!("{} request error: {}", provider, e)))?;

    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
        warn!("{} rate limit hit (retry-after: {:?})", provider, retry_after);
        return Err(CompletionError::RateLimited { retry_after });
    }

    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(CompletionError::Service(format!(
            "{} API error {}: {}",
            provider,
            status,
            extract_error_message(&text)
        )));
    }

    let parsed = resp
        .json::<ChatCompletionResponse>().await
        .map_err(|e| CompletionError::Service(format!("Malformed {} response: {}", provider, e)))?;
    debug!("{} returned {} choice(s)", provider, parsed.choices.len());

    first_choice_text(parsed).ok_or_else(||
        CompletionError::Service(format!("Empty completion from {} API", provider))
    )
}

fn first_choice_text(resp: ChatCompletionResponse) -> Option<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn extract_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.is_empty() => "<empty body>".to_string(),
        Err(_) => body.chars().take(200).collect(),
    }
}
