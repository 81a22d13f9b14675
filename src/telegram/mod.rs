use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use crate::models::telegram::{
    ApiResponse,
    GetUpdatesRequest,
    SendMessageRequest,
    SentMessage,
    Update,
};

/// Bot API refuses longer texts in a single sendMessage call. Telegram
/// measures length in UTF-16 code units.
pub const MAX_MESSAGE_UNITS: usize = 4096;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api {
        code: i64,
        description: String,
    },
    #[error("Telegram response for {0} carried no result")]
    EmptyResult(&'static str),
}

/// The two Bot API calls the relay depends on.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError>;
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;
}

pub struct TelegramClient {
    http: HttpClient,
    api_url: String,
    token: String,
    poll_timeout: u64,
}

impl TelegramClient {
    pub fn new(api_url: &str, token: String, poll_timeout: u64) -> Result<Self, TelegramError> {
        // Leave headroom above the long-poll window before reqwest gives up.
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(poll_timeout + 10))
            .build()?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            poll_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: &B
    ) -> Result<T, TelegramError> {
        // reqwest errors carry the URL, which embeds the token.
        let resp = self.http
            .post(self.method_url(method))
            .json(body)
            .send().await
            .map_err(|e| TelegramError::Http(e.without_url()))?;
        let parsed: ApiResponse<T> = resp
            .json().await
            .map_err(|e| TelegramError::Http(e.without_url()))?;
        unwrap_response(method, parsed)
    }
}

fn unwrap_response<T>(method: &'static str, resp: ApiResponse<T>) -> Result<T, TelegramError> {
    if !resp.ok {
        return Err(TelegramError::Api {
            code: resp.error_code.unwrap_or_default(),
            description: resp.description.unwrap_or_else(|| "unknown error".to_string()),
        });
    }
    resp.result.ok_or(TelegramError::EmptyResult(method))
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        let req = GetUpdatesRequest {
            offset,
            timeout: self.poll_timeout,
            allowed_updates: vec!["message".to_string()],
        };
        let updates: Vec<Update> = self.call("getUpdates", &req).await?;
        if !updates.is_empty() {
            debug!("Received {} update(s) from offset {}", updates.len(), offset);
        }
        Ok(updates)
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let req = SendMessageRequest { chat_id, text };
        let sent: SentMessage = self.call("sendMessage", &req).await?;
        debug!("Sent message {} to chat_id={}", sent.message_id, chat_id);
        Ok(())
    }
}

/// Splits `text` into pieces of at most `max_units` UTF-16 code units,
/// preferring line breaks as cut points.
pub fn split_message(text: &str, max_units: usize) -> Vec<&str> {
    // a surrogate pair must always fit
    let max_units = max_units.max(2);
    let mut parts = Vec::new();
    let mut rest = text;

    while rest.encode_utf16().count() > max_units {
        let hard_cut = utf16_cut(rest, max_units);
        let cut = match rest[..hard_cut].rfind('\n') {
            Some(idx) if idx > 0 => idx + 1,
            _ => hard_cut,
        };
        parts.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest);
    }
    parts
}

/// Byte offset of the longest prefix of `text` that fits in `max_units`.
fn utf16_cut(text: &str, max_units: usize) -> usize {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        units += ch.len_utf16();
        if units > max_units {
            return idx;
        }
    }
    text.len()
}
