use super::telegram_types::{
    ChatMemberStatus, InlineButton, Keyboard, ReplyButton, SentMessage,
};
use super::traits::BotApi;
use crate::funnel::types::{FileRef, MessageBody};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Telegram Bot API client -- JSON calls over reqwest.
pub struct TelegramChannel {
    bot_token: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    pub fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    /// Serialize a keyboard into the `reply_markup` JSON shape.
    pub fn reply_markup_json(keyboard: &Keyboard) -> serde_json::Value {
        match keyboard {
            Keyboard::Inline(rows) => {
                let rows: Vec<Vec<serde_json::Value>> = rows
                    .iter()
                    .map(|row| row.iter().map(inline_button_json).collect())
                    .collect();
                serde_json::json!({ "inline_keyboard": rows })
            }
            Keyboard::Reply {
                rows,
                one_time,
                placeholder,
            } => {
                let rows: Vec<Vec<serde_json::Value>> = rows
                    .iter()
                    .map(|row| row.iter().map(reply_button_json).collect())
                    .collect();
                let mut markup = serde_json::json!({
                    "keyboard": rows,
                    "resize_keyboard": true,
                    "one_time_keyboard": one_time,
                });
                if let Some(ph) = placeholder {
                    markup["input_field_placeholder"] = serde_json::Value::String(ph.clone());
                }
                markup
            }
            Keyboard::Remove => serde_json::json!({ "remove_keyboard": true }),
        }
    }

    async fn post(&self, method: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("Telegram {method} failed ({status}): {err}");
        }

        Ok(resp.json().await?)
    }

    fn message_id_from(data: &serde_json::Value) -> SentMessage {
        SentMessage {
            message_id: data["result"]["message_id"].as_i64().unwrap_or_default(),
        }
    }
}

fn inline_button_json(b: &InlineButton) -> serde_json::Value {
    match &b.press {
        super::telegram_types::ButtonPress::Url(url) => {
            serde_json::json!({ "text": b.text, "url": url })
        }
        super::telegram_types::ButtonPress::Callback(data) => {
            serde_json::json!({ "text": b.text, "callback_data": data })
        }
    }
}

fn reply_button_json(b: &ReplyButton) -> serde_json::Value {
    match b {
        ReplyButton::Text(text) => serde_json::json!({ "text": text }),
        ReplyButton::RequestContact(text) => {
            serde_json::json!({ "text": text, "request_contact": true })
        }
        ReplyButton::RequestLocation(text) => {
            serde_json::json!({ "text": text, "request_location": true })
        }
    }
}

fn file_value(file: &FileRef) -> &str {
    file.as_str()
}

#[async_trait]
impl BotApi for TelegramChannel {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<SentMessage> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = Self::reply_markup_json(kb);
        }

        match self.post("sendMessage", body).await {
            Ok(data) => Ok(Self::message_id_from(&data)),
            Err(markdown_err) => {
                // Retry without parse_mode as a compatibility fallback.
                tracing::warn!(
                    error = %markdown_err,
                    "sendMessage with Markdown failed; retrying without parse_mode"
                );
                let mut plain = serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                });
                if let Some(kb) = keyboard {
                    plain["reply_markup"] = Self::reply_markup_json(kb);
                }
                let data = self.post("sendMessage", plain).await?;
                Ok(Self::message_id_from(&data))
            }
        }
    }

    async fn send_media(
        &self,
        chat_id: i64,
        media: &MessageBody,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<SentMessage> {
        let (method, mut body) = match media {
            MessageBody::Text { text } => {
                return self.send_message(chat_id, text, keyboard).await;
            }
            MessageBody::Photo { file, caption } => {
                let mut b = serde_json::json!({ "chat_id": chat_id, "photo": file_value(file) });
                if let Some(cap) = caption {
                    b["caption"] = serde_json::Value::String(cap.clone());
                }
                ("sendPhoto", b)
            }
            MessageBody::Video { file, caption } => {
                let mut b = serde_json::json!({ "chat_id": chat_id, "video": file_value(file) });
                if let Some(cap) = caption {
                    b["caption"] = serde_json::Value::String(cap.clone());
                }
                ("sendVideo", b)
            }
            MessageBody::Voice { file, caption } => {
                let mut b = serde_json::json!({ "chat_id": chat_id, "voice": file_value(file) });
                if let Some(cap) = caption {
                    b["caption"] = serde_json::Value::String(cap.clone());
                }
                ("sendVoice", b)
            }
            MessageBody::VideoNote { file, duration } => {
                let mut b =
                    serde_json::json!({ "chat_id": chat_id, "video_note": file_value(file) });
                if let Some(d) = duration {
                    b["duration"] = serde_json::Value::from(*d);
                }
                ("sendVideoNote", b)
            }
            MessageBody::Document { file, caption } => {
                let mut b =
                    serde_json::json!({ "chat_id": chat_id, "document": file_value(file) });
                if let Some(cap) = caption {
                    b["caption"] = serde_json::Value::String(cap.clone());
                }
                ("sendDocument", b)
            }
            MessageBody::Location {
                latitude,
                longitude,
            } => (
                "sendLocation",
                serde_json::json!({
                    "chat_id": chat_id,
                    "latitude": latitude,
                    "longitude": longitude,
                }),
            ),
        };

        if let Some(kb) = keyboard {
            body["reply_markup"] = Self::reply_markup_json(kb);
        }

        let data = self.post(method, body).await?;
        Ok(Self::message_id_from(&data))
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = Self::reply_markup_json(kb);
        }
        self.post("editMessageText", body).await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        self.post(
            "deleteMessage",
            serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> anyhow::Result<()> {
        let mut body = serde_json::json!({
            "callback_query_id": callback_id,
            "show_alert": show_alert,
        });
        if let Some(t) = text {
            body["text"] = serde_json::Value::String(t.to_string());
        }
        self.post("answerCallbackQuery", body).await?;
        Ok(())
    }

    async fn get_chat_member(
        &self,
        channel: &str,
        user_id: i64,
    ) -> anyhow::Result<ChatMemberStatus> {
        let channel = format!("@{}", channel.trim_start_matches('@'));
        let data = self
            .post(
                "getChatMember",
                serde_json::json!({ "chat_id": channel, "user_id": user_id }),
            )
            .await?;
        let status = data["result"]["status"].as_str().unwrap_or("left");
        Ok(ChatMemberStatus::parse(status))
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> anyhow::Result<()> {
        self.post(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat_id, "action": action }),
        )
        .await?;
        Ok(())
    }
}

/// Compare the webhook secret header against the bot's configured secret.
///
/// Digest comparison avoids leaking match position through timing. A bot
/// with no configured secret accepts requests without the header.
pub fn verify_webhook_secret(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(want), Some(got)) => {
            Sha256::digest(want.as_bytes()) == Sha256::digest(got.as_bytes())
        }
    }
}
