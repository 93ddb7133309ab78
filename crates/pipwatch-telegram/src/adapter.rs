//! Telegram transport adapter.
//!
//! Outbound-only: wraps a teloxide `Bot` behind the engine's transport
//! port. Every message is tried as MarkdownV2 first and re-sent as plain
//! text when Telegram rejects the markup, so an escaping gap degrades the
//! formatting instead of dropping the notification.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, InputPollOption, ParseMode};
use tracing::debug;

use pipwatch_core::config::TelegramConfig;
use pipwatch_core::ports::{Transport, TransportError};

use crate::error::TelegramError;
use crate::send::{escape_markdown_v2, split_message};

/// Pause between consecutive chunks of one split message.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self, TelegramError> {
        if config.bot_token.is_empty() {
            return Err(TelegramError::NoToken);
        }
        Ok(Self {
            bot: Bot::new(&config.bot_token),
        })
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_text(&self, target: i64, text: &str) -> Result<(), TransportError> {
        let chat = ChatId(target);
        let chunks = split_message(text);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTER_CHUNK_DELAY).await;
            }
            let escaped = escape_markdown_v2(chunk);
            let sent = self
                .bot
                .send_message(chat, &escaped)
                .parse_mode(ParseMode::MarkdownV2)
                .await;
            if let Err(e) = sent {
                debug!(error = %e, chunk_index = i, "markdown send failed; retrying as plain text");
                self.bot
                    .send_message(chat, chunk.as_str())
                    .await
                    .map_err(classify)?;
            }
        }
        Ok(())
    }

    async fn send_image(
        &self,
        target: i64,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<(), TransportError> {
        let chat = ChatId(target);
        let escaped = escape_markdown_v2(caption);
        let sent = self
            .bot
            .send_photo(chat, InputFile::memory(image.clone()))
            .caption(&escaped)
            .parse_mode(ParseMode::MarkdownV2)
            .await;
        if let Err(e) = sent {
            debug!(error = %e, "photo with markdown caption failed; retrying as plain text");
            self.bot
                .send_photo(chat, InputFile::memory(image))
                .caption(caption)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn send_poll(
        &self,
        target: i64,
        question: &str,
        options: &[String],
    ) -> Result<(), TransportError> {
        let options: Vec<InputPollOption> = options
            .iter()
            .map(|o| InputPollOption::new(o.as_str()))
            .collect();
        self.bot
            .send_poll(ChatId(target), question, options)
            .is_anonymous(true)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Map a teloxide failure onto the engine's transport error taxonomy.
///
/// Gone chats (blocked, kicked, deactivated) are `Unreachable` so the
/// caller can stop retrying; everything else on the API side is a
/// permanent `Rejected`. Wire-level failures land in transient `Network`.
fn classify(e: teloxide::RequestError) -> TransportError {
    use teloxide::ApiError;

    match &e {
        teloxide::RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::GroupDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots => TransportError::Unreachable(e.to_string()),
            _ => TransportError::Rejected(e.to_string()),
        },
        teloxide::RequestError::MigrateToChatId(_) => TransportError::Unreachable(e.to_string()),
        _ => TransportError::Network(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::{ApiError, RequestError};

    #[test]
    fn gone_chats_classify_as_unreachable() {
        for api in [ApiError::BotBlocked, ApiError::ChatNotFound, ApiError::BotKicked] {
            let e = classify(RequestError::Api(api));
            assert!(matches!(e, TransportError::Unreachable(_)), "got {e:?}");
            assert!(!e.is_transient());
        }
    }

    #[test]
    fn api_rejections_are_permanent() {
        let e = classify(RequestError::Api(ApiError::CantParseEntities(
            "bad escape".to_string(),
        )));
        assert!(matches!(e, TransportError::Rejected(_)));
        assert!(!e.is_transient());
    }

    #[test]
    fn missing_token_fails_construction() {
        let config = TelegramConfig::default();
        assert!(matches!(
            TelegramTransport::new(&config),
            Err(TelegramError::NoToken)
        ));
    }

    #[test]
    fn token_accepted() {
        let config = TelegramConfig {
            bot_token: "123456:TEST".to_string(),
        };
        assert!(TelegramTransport::new(&config).is_ok());
    }
}
