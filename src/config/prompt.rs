use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use log::info;
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Ты — опытный автомеханик с 15-летним стажем. \
Твоя задача — помогать пользователям с вопросами по ремонту и диагностике автомобилей. \
Отвечай чётко, дружелюбно, без жаргона или очень простым языком. \
Если вопрос не по теме — вежливо скажи, что специализируешься только на автомобилях. \
Никогда не упоминай, что ты ИИ или бот.";

pub const DEFAULT_GREETING: &str = "Привет! Я — автоэксперт. 🛠️\n\
Опишите проблему с вашим автомобилем — помогу разобраться!\n\n\
Примеры:\n\
• Машина не заводится\n\
• Стук в двигателе\n\
• Горит лампочка 'Check Engine'\n\n\
Команды:\n\
/clear — начать диалог заново";

pub const DEFAULT_CLEARED: &str = "✅ История диалога очищена. Можете задать новый вопрос!";
pub const DEFAULT_RATE_LIMITED: &str = "Слишком много запросов. Попробуйте через 10 секунд.";
pub const DEFAULT_FAILURE: &str = "Извините, сейчас на СТО — напишите через минуту.";
pub const DEFAULT_EMPTY_INPUT: &str = "Пожалуйста, отправьте текстовое сообщение.";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Failed to read prompts file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse prompts file '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Prompt '{0}' must not be empty")]
    EmptyTemplate(&'static str),
}

/// System instruction plus every fixed string the bot sends.
///
/// A prompts file may override any subset of the fields; the rest keep the
/// built-in defaults.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub greeting: String,
    pub cleared: String,
    pub rate_limited: String,
    pub failure: String,
    pub empty_input: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            cleared: DEFAULT_CLEARED.to_string(),
            rate_limited: DEFAULT_RATE_LIMITED.to_string(),
            failure: DEFAULT_FAILURE.to_string(),
            empty_input: DEFAULT_EMPTY_INPUT.to_string(),
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        let fields = [
            ("system_prompt", &self.system_prompt),
            ("greeting", &self.greeting),
            ("cleared", &self.cleared),
            ("rate_limited", &self.rate_limited),
            ("failure", &self.failure),
            ("empty_input", &self.empty_input),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(PromptError::EmptyTemplate(name));
            }
        }
        Ok(())
    }
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    let display = path.as_ref().display().to_string();
    let file_content = fs::read_to_string(&path).map_err(|source| PromptError::Io {
        path: display.clone(),
        source,
    })?;
    let config: PromptConfig = serde_json::from_str(&file_content).map_err(|source| {
        PromptError::Json {
            path: display.clone(),
            source,
        }
    })?;
    config.validate()?;
    info!("Loaded prompts from: {}", display);
    Ok(Arc::new(config))
}

/// Built-in prompts when no file is configured.
pub fn load_prompts_or_default(path: Option<&str>) -> Result<Arc<PromptConfig>, PromptError> {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => load_prompts(p),
        None => {
            info!("No prompts file configured, using built-in prompts");
            Ok(Arc::new(PromptConfig::default()))
        }
    }
}
