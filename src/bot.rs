use crate::agent::ConversationHandler;
use crate::models::telegram::{ Message, Update };
use crate::telegram::{ split_message, ChatPlatform, MAX_MESSAGE_UNITS };
use governor::{ DefaultDirectRateLimiter, Quota, RateLimiter };
use log::{ info, warn, error };
use std::error::Error;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const POLL_ERROR_DELAY: Duration = Duration::from_secs(3);

/// Long-polls the platform and hands every message to its own task.
pub struct Bot {
    platform: Arc<dyn ChatPlatform>,
    handler: Arc<ConversationHandler>,
    send_limiter: Arc<DefaultDirectRateLimiter>,
}

impl Bot {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        handler: Arc<ConversationHandler>,
        sends_per_second: NonZeroU32
    ) -> Self {
        let send_limiter = Arc::new(RateLimiter::direct(Quota::per_second(sends_per_second)));
        Self { platform, handler, send_limiter }
    }

    /// Runs until Ctrl-C. Handlers already in flight finish on their own tasks.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut offset = 0;
        info!("Bot is up and polling for updates");

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    signal?;
                    info!("Shutdown requested, no longer polling for updates");
                    return Ok(());
                }
                result = self.platform.get_updates(offset) => {
                    match result {
                        Ok(updates) => {
                            offset = next_offset(offset, &updates);
                            for update in updates {
                                self.dispatch(update);
                            }
                        }
                        Err(e) => {
                            error!("Polling for updates failed: {}", e);
                            tokio::time::sleep(POLL_ERROR_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let platform = Arc::clone(&self.platform);
        let handler = Arc::clone(&self.handler);
        let limiter = Arc::clone(&self.send_limiter);
        tokio::spawn(async move {
            respond(platform.as_ref(), &handler, &limiter, message).await;
        });
    }
}

/// Acknowledge everything received so far.
fn next_offset(current: i64, updates: &[Update]) -> i64 {
    updates
        .iter()
        .map(|u| u.update_id + 1)
        .max()
        .map_or(current, |next| next.max(current))
}

/// Handles one inbound message and sends the reply back to the same chat.
pub(crate) async fn respond(
    platform: &dyn ChatPlatform,
    handler: &ConversationHandler,
    limiter: &DefaultDirectRateLimiter,
    message: Message
) {
    let chat_id = message.chat.id;
    let conversation_id = chat_id.to_string();

    let reply = match handler.handle(&conversation_id, message.text.as_deref()).await {
        Ok(reply) => reply.text().to_string(),
        Err(e) => {
            error!("History store failure for chat_id={}: {}", chat_id, e);
            handler.prompt_config().failure.clone()
        }
    };

    for part in split_message(&reply, MAX_MESSAGE_UNITS) {
        limiter.until_ready().await;
        if let Err(e) = platform.send_message(chat_id, part).await {
            warn!("Failed to deliver reply to chat_id={}: {}", chat_id, e);
            return;
        }
    }
}
