/// Failures raised while constructing the Telegram transport. Send-path
/// failures surface through the transport error taxonomy instead.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram bot token is empty")]
    NoToken,
}
