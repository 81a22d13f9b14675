use crate::command::Command;
use crate::config::prompt::PromptConfig;
use crate::history::{ HistoryError, HistoryStore };
use crate::llm::chat::{ ChatClient, CompletionError, CompletionOptions };
use crate::models::chat::{ Conversation, PromptMessage, Role };

use log::{ info, warn, error };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex, PoisonError };
use std::time::Duration;
use tokio::sync::{ Mutex as AsyncMutex, OwnedMutexGuard };

/// Idle per-conversation locks are pruned once the map grows past this.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after the zero-based `attempt_index` failed: `base * 2^index`.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// What the bot sends back for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer(String),
    Greeting(String),
    Cleared(String),
    EmptyInput(String),
    RateLimited(String),
    Failed(String),
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Answer(text)
            | Reply::Greeting(text)
            | Reply::Cleared(text)
            | Reply::EmptyInput(text)
            | Reply::RateLimited(text)
            | Reply::Failed(text) => text,
        }
    }
}

/// Turns one inbound message into exactly one reply.
///
/// Holds no conversation state of its own; the history store owns every
/// message. Cycles for the same conversation are serialized through a
/// per-conversation async lock, including the backoff sleeps, while other
/// conversations proceed independently.
pub struct ConversationHandler {
    history_store: Arc<dyn HistoryStore>,
    chat_client: Arc<dyn ChatClient>,
    prompt_config: Arc<PromptConfig>,
    options: CompletionOptions,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationHandler {
    pub fn new(
        history_store: Arc<dyn HistoryStore>,
        chat_client: Arc<dyn ChatClient>,
        prompt_config: Arc<PromptConfig>,
        options: CompletionOptions,
        retry: RetryPolicy
    ) -> Self {
        Self {
            history_store,
            chat_client,
            prompt_config,
            options,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn prompt_config(&self) -> &PromptConfig {
        &self.prompt_config
    }

    /// Routes an inbound event: blank input, commands, then questions.
    pub async fn handle(
        &self,
        conversation_id: &str,
        text: Option<&str>
    ) -> Result<Reply, HistoryError> {
        let text = match text.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => t,
            None => {
                return Ok(Reply::EmptyInput(self.prompt_config.empty_input.clone()));
            }
        };

        match Command::parse(text) {
            Some(Command::Start) => self.greet(conversation_id).await,
            Some(Command::Clear) => self.clear(conversation_id).await,
            None => self.process_message(conversation_id, text).await,
        }
    }

    /// The greeting is stored as an assistant turn so the model sees it.
    pub async fn greet(&self, conversation_id: &str) -> Result<Reply, HistoryError> {
        let _guard = self.lock_conversation(conversation_id).await;
        let greeting = self.prompt_config.greeting.clone();
        self.history_store.append(conversation_id, Role::Assistant, &greeting).await?;
        Ok(Reply::Greeting(greeting))
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<Reply, HistoryError> {
        let _guard = self.lock_conversation(conversation_id).await;
        self.history_store.clear(conversation_id).await?;
        info!("History cleared for chat_id={}", conversation_id);
        Ok(Reply::Cleared(self.prompt_config.cleared.clone()))
    }

    pub async fn process_message(
        &self,
        conversation_id: &str,
        message: &str
    ) -> Result<Reply, HistoryError> {
        let message = message.trim();
        if message.is_empty() {
            return Ok(Reply::EmptyInput(self.prompt_config.empty_input.clone()));
        }

        let _guard = self.lock_conversation(conversation_id).await;
        self.history_store.append(conversation_id, Role::User, message).await?;
        let conversation = self.history_store.read(conversation_id).await?;
        let prompt = self.build_prompt(&conversation);

        match self.complete_with_retry(conversation_id, &prompt).await {
            Ok(answer) if answer.trim().is_empty() => {
                error!("Completion for chat_id={} came back empty", conversation_id);
                Ok(Reply::Failed(self.prompt_config.failure.clone()))
            }
            Ok(answer) => {
                self.history_store.append(conversation_id, Role::Assistant, &answer).await?;
                Ok(Reply::Answer(answer))
            }
            Err(CompletionError::RateLimited { .. }) =>
                Ok(Reply::RateLimited(self.prompt_config.rate_limited.clone())),
            Err(CompletionError::Service(e)) => {
                error!("Completion failed for chat_id={}: {}", conversation_id, e);
                Ok(Reply::Failed(self.prompt_config.failure.clone()))
            }
        }
    }

    /// System instruction first, then the stored history with original roles.
    pub fn build_prompt(&self, conversation: &Conversation) -> Vec<PromptMessage> {
        let mut prompt = Vec::with_capacity(conversation.messages.len() + 1);
        prompt.push(PromptMessage::new(Role::System, self.prompt_config.system_prompt.clone()));
        prompt.extend(conversation.messages.iter().map(PromptMessage::from));
        prompt
    }

    async fn complete_with_retry(
        &self,
        conversation_id: &str,
        prompt: &[PromptMessage]
    ) -> Result<String, CompletionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.chat_client.complete(prompt, &self.options).await {
                Ok(answer) => {
                    return Ok(answer);
                }
                Err(err @ CompletionError::RateLimited { .. }) => {
                    warn!(
                        "Rate limit (attempt {}/{}) for chat_id={}",
                        attempt + 1,
                        max_attempts,
                        conversation_id
                    );
                    if attempt + 1 >= max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err);
                }
            }
        }
    }

    async fn lock_conversation(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(conversation_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::llm::LlmType;
    use crate::models::chat::ChatMessage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use tokio::time::Instant;

    /// Replays scripted outcomes and records every prompt it receives.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, CompletionError>>>,
        calls: Mutex<Vec<(Instant, Vec<PromptMessage>)>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn always(outcome: fn() -> Result<String, CompletionError>, times: usize) -> Arc<Self> {
            Self::new((0..times).map(|_| outcome()).collect())
        }

        fn calls(&self) -> Vec<(Instant, Vec<PromptMessage>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(
            &self,
            messages: &[PromptMessage],
            _options: &CompletionOptions
        ) -> Result<String, CompletionError> {
            self.calls.lock().unwrap().push((Instant::now(), messages.to_vec()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Service("script exhausted".into())))
        }

        fn get_model(&self) -> String {
            "scripted".into()
        }

        fn get_base_url(&self) -> String {
            String::new()
        }

        fn get_llm_type(&self) -> LlmType {
            LlmType::Groq
        }
    }

    /// Sleeps inside every call and tracks how many calls overlap.
    struct SlowClient {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for SlowClient {
        async fn complete(
            &self,
            _messages: &[PromptMessage],
            _options: &CompletionOptions
        ) -> Result<String, CompletionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("done".into())
        }

        fn get_model(&self) -> String {
            "slow".into()
        }

        fn get_base_url(&self) -> String {
            String::new()
        }

        fn get_llm_type(&self) -> LlmType {
            LlmType::Groq
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl HistoryStore for BrokenStore {
        async fn append(&self, id: &str, _role: Role, _content: &str) -> Result<(), HistoryError> {
            Err(HistoryError::Corrupt { conversation_id: id.into(), reason: "disk gone".into() })
        }

        async fn read(&self, id: &str) -> Result<Conversation, HistoryError> {
            Err(HistoryError::Corrupt { conversation_id: id.into(), reason: "disk gone".into() })
        }

        async fn clear(&self, _id: &str) -> Result<(), HistoryError> {
            Ok(())
        }

        fn limit(&self) -> usize {
            10
        }
    }

    fn rate_limited() -> Result<String, CompletionError> {
        Err(CompletionError::RateLimited { retry_after: None })
    }

    fn options() -> CompletionOptions {
        CompletionOptions {
            model: "llama-3.1-8b-instant".into(),
            max_tokens: 256,
            temperature: 0.7,
        }
    }

    fn handler(
        store: Arc<dyn HistoryStore>,
        client: Arc<dyn ChatClient>
    ) -> ConversationHandler {
        ConversationHandler::new(
            store,
            client,
            Arc::new(PromptConfig::default()),
            options(),
            RetryPolicy::default()
        )
    }

    fn roles_and_contents(messages: &[ChatMessage]) -> Vec<(Role, String)> {
        messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn success_appends_user_and_assistant_turns() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(vec![Ok("Это может быть из-за...".into())]);
        let handler = handler(store.clone(), client.clone());

        let reply = handler.handle("42", Some("Check Engine light is on.")).await.unwrap();
        assert_eq!(reply, Reply::Answer("Это может быть из-за...".into()));

        let conversation = store.read("42").await.unwrap();
        assert_eq!(
            roles_and_contents(&conversation.messages),
            vec![
                (Role::User, "Check Engine light is on.".to_string()),
                (Role::Assistant, "Это может быть из-за...".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn prompt_starts_with_system_instruction_then_full_history() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        store.append("7", Role::User, "earlier question").await.unwrap();
        store.append("7", Role::Assistant, "earlier answer").await.unwrap();
        let client = ScriptedClient::new(vec![Ok("X".into())]);
        let handler = handler(store.clone(), client.clone());

        let reply = handler.handle("7", Some("  hi  ")).await.unwrap();
        assert_eq!(reply.text(), "X");

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        let prompt = &calls[0].1;
        assert_eq!(
            prompt,
            &vec![
                PromptMessage::new(Role::System, PromptConfig::default().system_prompt),
                PromptMessage::new(Role::User, "earlier question"),
                PromptMessage::new(Role::Assistant, "earlier answer"),
                PromptMessage::new(Role::User, "hi")
            ]
        );
        let stored = store.read("7").await.unwrap();
        assert_eq!(stored.messages.last().unwrap().content, "X");
        assert_eq!(stored.messages.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_three_times_with_backoff() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::always(rate_limited, 5);
        let handler = handler(store.clone(), client.clone());

        let reply = handler.handle("1", Some("hello")).await.unwrap();
        assert_eq!(reply, Reply::RateLimited(PromptConfig::default().rate_limited));

        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));

        let conversation = store.read("1").await.unwrap();
        assert_eq!(roles_and_contents(&conversation.messages), vec![(Role::User, "hello".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_success_stores_reply() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(vec![rate_limited(), Ok("fixed".into())]);
        let handler = handler(store.clone(), client.clone());

        let reply = handler.handle("1", Some("hello")).await.unwrap();
        assert_eq!(reply, Reply::Answer("fixed".into()));
        assert_eq!(client.calls().len(), 2);
        assert_eq!(store.read("1").await.unwrap().messages.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn service_error_is_not_retried() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(
            vec![Err(CompletionError::Service("500".into())), Ok("never".into())]
        );
        let handler = handler(store.clone(), client.clone());
        let started = Instant::now();

        let reply = handler.handle("1", Some("hello")).await.unwrap();
        assert_eq!(reply, Reply::Failed(PromptConfig::default().failure));
        assert_eq!(client.calls().len(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let conversation = store.read("1").await.unwrap();
        assert_eq!(roles_and_contents(&conversation.messages), vec![(Role::User, "hello".to_string())]);
    }

    #[tokio::test]
    async fn blank_completion_is_a_failure() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(vec![Ok("  \n".into())]);
        let handler = handler(store.clone(), client.clone());

        let reply = handler.handle("1", Some("hello")).await.unwrap();
        assert_eq!(reply, Reply::Failed(PromptConfig::default().failure));
        assert_eq!(client.calls().len(), 1);

        let conversation = store.read("1").await.unwrap();
        assert_eq!(roles_and_contents(&conversation.messages), vec![(Role::User, "hello".to_string())]);
    }

    #[tokio::test]
    async fn empty_input_changes_nothing() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(vec![]);
        let handler = handler(store.clone(), client.clone());

        for text in [None, Some(""), Some("   \n")] {
            let reply = handler.handle("5", text).await.unwrap();
            assert_eq!(reply, Reply::EmptyInput(PromptConfig::default().empty_input));
        }
        assert!(client.calls().is_empty());
        assert!(store.read("5").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_records_greeting_as_assistant_turn() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let handler = handler(store.clone(), ScriptedClient::new(vec![]));

        let reply = handler.handle("9", Some("/start")).await.unwrap();
        let greeting = PromptConfig::default().greeting;
        assert_eq!(reply, Reply::Greeting(greeting.clone()));
        assert_eq!(
            roles_and_contents(&store.read("9").await.unwrap().messages),
            vec![(Role::Assistant, greeting)]
        );
    }

    #[tokio::test]
    async fn clear_wipes_history_without_recording_confirmation() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new(vec![Ok("answer".into())]);
        let handler = handler(store.clone(), client);

        handler.handle("3", Some("/start")).await.unwrap();
        handler.handle("3", Some("question")).await.unwrap();
        let reply = handler.handle("3", Some("/clear")).await.unwrap();

        assert_eq!(reply, Reply::Cleared(PromptConfig::default().cleared));
        assert!(store.read("3").await.unwrap().is_empty());

        let again = handler.handle("3", Some("/clear")).await.unwrap();
        assert!(matches!(again, Reply::Cleared(_)));
    }

    #[tokio::test]
    async fn retention_window_applies_through_handler() {
        let store = Arc::new(MemoryHistoryStore::new(10));
        let client = ScriptedClient::new((0..8).map(|i| Ok(format!("a{}", i))).collect());
        let handler = handler(store.clone(), client.clone());

        for i in 0..8 {
            handler.handle("42", Some(&format!("q{}", i))).await.unwrap();
        }

        let conversation = store.read("42").await.unwrap();
        let contents: Vec<String> = conversation.messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(
            contents,
            vec!["q3", "a3", "q4", "a4", "q5", "a5", "q6", "a6", "q7", "a7"]
        );
        // system prompt + a full retention window
        let calls = client.calls();
        let last_prompt = &calls.last().unwrap().1;
        assert_eq!(last_prompt.len(), 11);
        assert_eq!(last_prompt[0].role, Role::System);
    }

    #[tokio::test]
    async fn storage_faults_propagate() {
        let client = ScriptedClient::new(vec![Ok("unused".into())]);
        let handler = handler(Arc::new(BrokenStore), client.clone());

        let err = handler.handle("1", Some("hello")).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupt { .. }));
        assert!(client.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_conversation_is_serialized() {
        let client = Arc::new(SlowClient {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let handler = Arc::new(handler(Arc::new(MemoryHistoryStore::new(10)), client.clone()));

        let a = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle("same", Some("one")).await }
        });
        let b = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle("same", Some("two")).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_conversations_overlap() {
        let client = Arc::new(SlowClient {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let handler = Arc::new(handler(Arc::new(MemoryHistoryStore::new(10)), client.clone()));

        let a = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle("first", Some("one")).await }
        });
        let b = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle("second", Some("two")).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
