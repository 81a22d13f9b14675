use async_trait::async_trait;
use log::info;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;

use super::{ build_http_client, post_chat_completion, ChatClient, CompletionError, CompletionOptions };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::PromptMessage;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_completion_tokens: u32,
    store: bool,
}

impl OpenAIChatClient {
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
            .ok_or_else(|| CompletionError::Service("OpenAI API key is required".to_string()))?;

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
impl ChatClient for OpenAIChatClient {
    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &CompletionOptions
    ) -> Result<String, CompletionError> {
        let req = OpenAIChatRequest {
            model: &options.model,
            messages,
            temperature: options.temperature,
            max_completion_tokens: options.max_tokens,
            store: false,
        };

        info!("Sending {} message(s) to OpenAI model {}", messages.len(), options.model);
        post_chat_completion(&self.http, &self.endpoint(), &req, "OpenAI").await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> String {
        self.base_url.clone()
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;

    #[test]
    fn request_uses_completion_token_field() {
        let messages = vec![PromptMessage::new(Role::User, "hi")];
        let req = OpenAIChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.7,
            max_completion_tokens: 256,
            store: false,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["max_completion_tokens"], 256);
        assert!(value.get("max_tokens").is_none());
        assert_eq!(value["store"], false);
    }

    #[test]
    fn custom_model_wins_over_default() {
        let config = LlmConfig {
            llm_type: LlmType::OpenAI,
            api_key: Some("sk-test".into()),
            completion_model: Some("gpt-4o".into()),
            ..LlmConfig::default()
        };
        let client = OpenAIChatClient::from_config(&config).unwrap();
        assert_eq!(client.get_model(), "gpt-4o");
        assert_eq!(client.get_base_url(), DEFAULT_BASE_URL);
    }
}
