use async_trait::async_trait;
use log::info;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;

use super::{ build_http_client, post_chat_completion, ChatClient, CompletionError, CompletionOptions };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::PromptMessage;

pub const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

pub struct GroqChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct GroqRequest<'a> {
    messages: &'a [PromptMessage],
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
}

impl GroqChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        timeout: Duration
    ) -> Result<Self, CompletionError> {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = build_http_client(&api_key, timeout)?;

        Ok(Self {
            http,
            model: chat_model,
            base_url: api_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| CompletionError::Service("Groq API key is required".to_string()))?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.request_timeout
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatClient for GroqChatClient {
    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions
    ) -> Result<String, CompletionError> {
        let req = GroqRequest {
            messages,
            model: &options.model,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        info!("Sending {} message(s) to Groq model {}", messages.len(), options.model);
        post_chat_completion(&self.http, &self.endpoint(), &req, "Groq").await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> String {
        self.base_url.clone()
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Groq
    }
}
