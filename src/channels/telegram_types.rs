use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Inbound update shapes ───────────────────────────────────────

/// One webhook delivery from the Bot API. Only `message` and
/// `callback_query` updates are processed; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub contact: Option<ContactPayload>,
    #[serde(default)]
    pub location: Option<LocationPayload>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub document: Option<DocumentPayload>,
    #[serde(default)]
    pub voice: Option<VoicePayload>,
    #[serde(default)]
    pub audio: Option<AudioPayload>,
    #[serde(default)]
    pub video: Option<VideoPayload>,
    #[serde(default)]
    pub sticker: Option<Value>,
}

impl IncomingMessage {
    /// Text or caption, empty string when neither is present.
    pub fn text_or_caption(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }

    pub fn is_command(&self) -> bool {
        self.text.as_deref().is_some_and(|t| t.starts_with('/'))
    }

    /// Content-type tag for the message audit log.
    pub fn content_kind(&self) -> &'static str {
        if self.photo.is_some() {
            "photo"
        } else if self.video.is_some() {
            "video"
        } else if self.document.is_some() {
            "document"
        } else if self.voice.is_some() {
            "voice"
        } else if self.audio.is_some() {
            "audio"
        } else if self.sticker.is_some() {
            "sticker"
        } else if self.location.is_some() {
            "location"
        } else if self.contact.is_some() {
            "contact"
        } else if self.is_command() {
            "command"
        } else {
            "text"
        }
    }

    /// Extracted content fields for the audit log, by content kind.
    pub fn content_json(&self) -> Map<String, Value> {
        let mut content = Map::new();
        match self.content_kind() {
            "text" => {
                content.insert("text".into(), Value::String(self.text_or_caption().into()));
            }
            "command" => {
                let text = self.text_or_caption();
                let mut parts = text.splitn(2, ' ');
                content.insert(
                    "command".into(),
                    Value::String(parts.next().unwrap_or_default().into()),
                );
                if let Some(args) = parts.next() {
                    content.insert("args".into(), Value::String(args.into()));
                }
            }
            "photo" => {
                if let Some(largest) = self.photo.as_ref().and_then(|p| p.last()) {
                    content.insert("file_id".into(), Value::String(largest.file_id.clone()));
                }
                if let Some(ref cap) = self.caption {
                    content.insert("caption".into(), Value::String(cap.clone()));
                }
            }
            "video" => {
                if let Some(ref v) = self.video {
                    content.insert("file_id".into(), Value::String(v.file_id.clone()));
                }
                if let Some(ref cap) = self.caption {
                    content.insert("caption".into(), Value::String(cap.clone()));
                }
            }
            "document" => {
                if let Some(ref d) = self.document {
                    content.insert("file_id".into(), Value::String(d.file_id.clone()));
                    if let Some(ref name) = d.file_name {
                        content.insert("file_name".into(), Value::String(name.clone()));
                    }
                }
            }
            "voice" => {
                if let Some(ref v) = self.voice {
                    content.insert("file_id".into(), Value::String(v.file_id.clone()));
                    if let Some(d) = v.duration {
                        content.insert("duration".into(), Value::from(d));
                    }
                }
            }
            "location" => {
                if let Some(ref l) = self.location {
                    content.insert("latitude".into(), Value::from(l.latitude));
                    content.insert("longitude".into(), Value::from(l.longitude));
                }
            }
            "contact" => {
                if let Some(ref c) = self.contact {
                    content.insert(
                        "phone_number".into(),
                        Value::String(c.phone_number.clone()),
                    );
                    if let Some(ref f) = c.first_name {
                        content.insert("first_name".into(), Value::String(f.clone()));
                    }
                    if let Some(ref l) = c.last_name {
                        content.insert("last_name".into(), Value::String(l.clone()));
                    }
                }
            }
            _ => {}
        }
        content
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactPayload {
    pub phone_number: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentPayload {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoicePayload {
    pub file_id: String,
    #[serde(default)]
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioPayload {
    pub file_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoPayload {
    pub file_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: Sender,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

// ── Outbound keyboard model ─────────────────────────────────────

/// A rendered keyboard, ready to serialize as `reply_markup`.
#[derive(Debug, Clone, PartialEq)]
pub enum Keyboard {
    Inline(Vec<Vec<InlineButton>>),
    Reply {
        rows: Vec<Vec<ReplyButton>>,
        one_time: bool,
        placeholder: Option<String>,
    },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub press: ButtonPress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonPress {
    Url(String),
    Callback(String),
}

impl InlineButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            press: ButtonPress::Callback(data.into()),
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            press: ButtonPress::Url(url.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyButton {
    Text(String),
    RequestContact(String),
    RequestLocation(String),
}

/// Result of a successful send: the platform-assigned message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: i64,
}

/// Membership status from `getChatMember`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    Unknown,
}

impl ChatMemberStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "creator" => ChatMemberStatus::Creator,
            "administrator" => ChatMemberStatus::Administrator,
            "member" => ChatMemberStatus::Member,
            "restricted" => ChatMemberStatus::Restricted,
            "left" => ChatMemberStatus::Left,
            "kicked" => ChatMemberStatus::Kicked,
            _ => ChatMemberStatus::Unknown,
        }
    }

    /// Counted as subscribed for subscribe-check gates.
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self,
            ChatMemberStatus::Member | ChatMemberStatus::Administrator | ChatMemberStatus::Creator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_parses_message() {
        let json = r#"{
            "update_id": 10,
            "message": {
                "message_id": 5,
                "from": {"id": 42, "is_bot": false, "first_name": "Ada", "username": "ada"},
                "chat": {"id": 42},
                "text": "hello"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.from.as_ref().unwrap().id, 42);
        assert_eq!(msg.content_kind(), "text");
    }

    #[test]
    fn update_parses_callback_query() {
        let json = r#"{
            "update_id": 11,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 42},
                "message": {"message_id": 5, "chat": {"id": 42}},
                "data": "quiz_answer:s1:1"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let cb = update.callback_query.unwrap();
        assert_eq!(cb.data.as_deref(), Some("quiz_answer:s1:1"));
        assert_eq!(cb.message.unwrap().chat.id, 42);
    }

    #[test]
    fn content_kind_priority() {
        let mut msg = IncomingMessage {
            text: Some("/start promo".into()),
            ..Default::default()
        };
        assert_eq!(msg.content_kind(), "command");
        msg.contact = Some(ContactPayload {
            phone_number: "+998901234567".into(),
            first_name: None,
            last_name: None,
        });
        assert_eq!(msg.content_kind(), "contact");
    }

    #[test]
    fn command_content_json_splits_args() {
        let msg = IncomingMessage {
            text: Some("/start promo2026".into()),
            ..Default::default()
        };
        let content = msg.content_json();
        assert_eq!(content["command"], "/start");
        assert_eq!(content["args"], "promo2026");
    }

    #[test]
    fn chat_member_status_subscription() {
        assert!(ChatMemberStatus::parse("member").is_subscribed());
        assert!(ChatMemberStatus::parse("creator").is_subscribed());
        assert!(ChatMemberStatus::parse("administrator").is_subscribed());
        assert!(!ChatMemberStatus::parse("left").is_subscribed());
        assert!(!ChatMemberStatus::parse("kicked").is_subscribed());
        assert!(!ChatMemberStatus::parse("whatever").is_subscribed());
    }
}
