use super::telegram_types::{ChatMemberStatus, Keyboard, SentMessage};
use crate::funnel::types::MessageBody;
use async_trait::async_trait;

/// The narrow messaging contract the engine consumes. The wire-level
/// client (retries, rate limits) lives behind this seam; tests implement
/// it with a recording mock.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Send a text message, optionally with a keyboard.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<SentMessage>;

    /// Send a media body (photo, video, voice, video note, document,
    /// location), optionally with a keyboard.
    async fn send_media(
        &self,
        chat_id: i64,
        body: &MessageBody,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<SentMessage>;

    /// Edit a previously sent message's text and keyboard.
    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;

    /// Answer a callback query, clearing the client's loading indicator.
    /// `show_alert` turns the text into a blocking popup.
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> anyhow::Result<()>;

    /// Query a user's membership status in a channel.
    async fn get_chat_member(
        &self,
        channel: &str,
        user_id: i64,
    ) -> anyhow::Result<ChatMemberStatus>;

    /// Show a "typing" indicator in the chat.
    async fn send_chat_action(&self, chat_id: i64, action: &str) -> anyhow::Result<()>;
}
