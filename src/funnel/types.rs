use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Insertion-ordered JSON object (serde_json is built with `preserve_order`).
pub type JsonMap = Map<String, Value>;

// ── Bot ─────────────────────────────────────────────────────────

/// Per-bot configuration the engine reads. Authored externally; the
/// engine never writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    pub id: String,
    pub business_id: String,
    pub token: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub default_funnel_id: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_welcome")]
    pub welcome_message: String,
    #[serde(default = "default_fallback")]
    pub fallback_message: String,
    #[serde(default = "default_help")]
    pub help_message: String,
    #[serde(default = "default_handoff")]
    pub handoff_message: String,
    #[serde(default = "default_contact_received")]
    pub contact_received_message: String,
    #[serde(default = "default_validation_error")]
    pub validation_error_message: String,
    #[serde(default = "default_true")]
    pub request_contact_on_start: bool,
    #[serde(default = "default_true")]
    pub typing_action: bool,
}

fn default_true() -> bool {
    true
}

fn default_welcome() -> String {
    "Welcome! Send /start to begin.".into()
}

fn default_fallback() -> String {
    "Sorry, I didn't understand that. Send /help for options.".into()
}

fn default_help() -> String {
    "Need help? Send /start to begin or /cancel to stop.".into()
}

fn default_handoff() -> String {
    "Connecting you with an operator. Please wait...".into()
}

fn default_contact_received() -> String {
    "Thank you! Your phone number has been saved.".into()
}

fn default_validation_error() -> String {
    "Invalid format. Please try again.".into()
}

impl BotSettings {
    pub fn new(id: impl Into<String>, business_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            business_id: business_id.into(),
            token: token.into(),
            username: None,
            display_name: None,
            is_active: true,
            default_funnel_id: None,
            webhook_secret: None,
            welcome_message: default_welcome(),
            fallback_message: default_fallback(),
            help_message: default_help(),
            handoff_message: default_handoff(),
            contact_received_message: default_contact_received(),
            validation_error_message: default_validation_error(),
            request_contact_on_start: true,
            typing_action: true,
        }
    }
}

// ── Funnel graph ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funnel {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub first_step_id: Option<String>,
    #[serde(default)]
    pub completion_message: Option<String>,
}

/// One node in a funnel graph. `config` carries the type-specific payload;
/// `input`/`next_step_id`/`action` are shared across types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub funnel_id: String,
    pub name: String,
    pub config: StepConfig,
    #[serde(default)]
    pub input: Option<InputSpec>,
    #[serde(default)]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub action: Option<ActionSpec>,
}

impl Step {
    /// Field name collected input is stored under. Defaults to the step name.
    pub fn field_name(&self) -> &str {
        self.input
            .as_ref()
            .and_then(|i| i.field.as_deref())
            .unwrap_or(&self.name)
    }

    /// Short tag for the step type, used as a queryable DB column.
    pub fn step_type(&self) -> &'static str {
        match self.config {
            StepConfig::Content(_) => "content",
            StepConfig::Condition(_) => "condition",
            StepConfig::SubscribeCheck(_) => "subscribe_check",
            StepConfig::Quiz(_) => "quiz",
            StepConfig::AbTest(_) => "ab_test",
            StepConfig::Tag(_) => "tag",
            StepConfig::TriggerKeyword(_) => "trigger_keyword",
        }
    }

    /// Every step id this step can branch to, across all branch kinds.
    pub fn outgoing_edges(&self) -> Vec<&str> {
        let mut edges: Vec<&str> = Vec::new();
        if let Some(ref next) = self.next_step_id {
            edges.push(next);
        }
        match &self.config {
            StepConfig::Condition(c) => {
                edges.extend(c.true_step_id.as_deref());
                edges.extend(c.false_step_id.as_deref());
            }
            StepConfig::SubscribeCheck(s) => edges.extend(s.true_step_id.as_deref()),
            StepConfig::Quiz(q) => {
                edges.extend(q.options.iter().filter_map(|o| o.next_step_id.as_deref()))
            }
            StepConfig::AbTest(a) => {
                edges.extend(a.variants.iter().filter_map(|v| v.next_step_id.as_deref()))
            }
            _ => {}
        }
        edges
    }
}

/// Type-specific step payload, tagged by `step_type`. One variant per step
/// type so each carries only its own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepConfig {
    Content(ContentConfig),
    Condition(ConditionConfig),
    SubscribeCheck(SubscribeCheckConfig),
    Quiz(QuizConfig),
    AbTest(AbTestConfig),
    Tag(TagConfig),
    TriggerKeyword(KeywordSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    pub body: MessageBody,
    #[serde(default)]
    pub keyboard: Option<KeyboardSpec>,
}

impl ContentConfig {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text { text: text.into() },
            keyboard: None,
        }
    }
}

/// Outgoing message payload for a content step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Photo {
        file: FileRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        file: FileRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Voice {
        file: FileRef,
        #[serde(default)]
        caption: Option<String>,
    },
    VideoNote {
        file: FileRef,
        #[serde(default)]
        duration: Option<u32>,
    },
    Document {
        file: FileRef,
        #[serde(default)]
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
}

impl MessageBody {
    /// The interpolatable text of this body, if any.
    pub fn text_mut(&mut self) -> Option<&mut String> {
        match self {
            MessageBody::Text { text } => Some(text),
            MessageBody::Photo { caption, .. }
            | MessageBody::Video { caption, .. }
            | MessageBody::Voice { caption, .. }
            | MessageBody::Document { caption, .. } => caption.as_mut(),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            MessageBody::Text { .. } => "text",
            MessageBody::Photo { .. } => "photo",
            MessageBody::Video { .. } => "video",
            MessageBody::Voice { .. } => "voice",
            MessageBody::VideoNote { .. } => "video_note",
            MessageBody::Document { .. } => "document",
            MessageBody::Location { .. } => "location",
        }
    }
}

/// A media reference: a Telegram-hosted file id or a public URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRef {
    FileId(String),
    Url(String),
}

impl FileRef {
    pub fn as_str(&self) -> &str {
        match self {
            FileRef::FileId(s) | FileRef::Url(s) => s,
        }
    }
}

// ── Keyboards (authored specs) ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyboardSpec {
    Inline {
        rows: Vec<Vec<InlineButtonSpec>>,
    },
    Reply {
        rows: Vec<Vec<ReplyButtonSpec>>,
        #[serde(default)]
        one_time: bool,
        #[serde(default)]
        placeholder: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineButtonSpec {
    pub text: String,
    pub action: ButtonAction,
}

/// What pressing an authored inline button does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ButtonAction {
    Url {
        url: String,
    },
    /// Raw callback data, matched against callback-type triggers.
    Callback {
        data: String,
    },
    GoToStep {
        step_id: String,
    },
    /// Store a value into collected data. `field` defaults to the step's
    /// input field at render time.
    Input {
        #[serde(default)]
        field: Option<String>,
        value: String,
    },
    /// Follow the step's own `next_step_id`.
    NextStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyButtonSpec {
    Text { text: String },
    RequestContact { text: String },
    RequestLocation { text: String },
}

// ── Condition steps ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub clause: ConditionClause,
    #[serde(default)]
    pub true_step_id: Option<String>,
    #[serde(default)]
    pub false_step_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionClause {
    pub field: String,
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

/// Unrecognized operators deserialize to `Unknown` and evaluate false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsSet,
    IsEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    IsTrue,
    IsFalse,
    #[serde(other)]
    Unknown,
}

// ── Subscribe-check steps ───────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeCheckConfig {
    /// Channel handle, with or without the leading `@`.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub join_button_text: Option<String>,
    #[serde(default)]
    pub true_step_id: Option<String>,
}

// ── Quiz steps ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizConfig {
    pub question: String,
    pub options: Vec<QuizOption>,
    #[serde(default)]
    pub save_answer_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizOption {
    pub text: String,
    #[serde(default)]
    pub next_step_id: Option<String>,
}

// ── A/B test steps ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    pub variants: Vec<AbVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbVariant {
    pub name: String,
    /// Percentage weight; variants conceptually sum to 100.
    pub weight: u32,
    #[serde(default)]
    pub next_step_id: Option<String>,
}

// ── Tag steps ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    #[serde(default)]
    pub action: TagAction,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAction {
    #[default]
    Add,
    Remove,
}

// ── Keyword entry markers (trigger_keyword steps) ───────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordSpec {
    /// Catch-all: match any message text.
    #[serde(default)]
    pub all_messages: bool,
    /// Comma- or newline-separated keyword list.
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub match_mode: MatchMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

// ── Input collection ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub kind: InputKind,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub rules: ValidationRules,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl InputSpec {
    pub fn new(kind: InputKind) -> Self {
        Self {
            kind,
            field: None,
            rules: ValidationRules::default(),
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    Email,
    Phone,
    Number,
    Contact,
    Location,
    Photo,
    Document,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Text => "text",
            InputKind::Email => "email",
            InputKind::Phone => "phone",
            InputKind::Number => "number",
            InputKind::Contact => "contact",
            InputKind::Location => "location",
            InputKind::Photo => "photo",
            InputKind::Document => "document",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "text" => InputKind::Text,
            "email" => InputKind::Email,
            "phone" => InputKind::Phone,
            "number" => InputKind::Number,
            "contact" => InputKind::Contact,
            "location" => InputKind::Location,
            "photo" => InputKind::Photo,
            "document" => InputKind::Document,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
}

// ── Terminal actions ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionSpec {
    CreateLead(CreateLeadConfig),
    UpdateUser {
        /// collected-data field -> profile field (or the custom-data bag).
        field_mapping: JsonMap,
    },
    Handoff {
        #[serde(default)]
        reason: Option<String>,
    },
    SendNotification {
        #[serde(default)]
        config: JsonMap,
    },
    Webhook {
        #[serde(default)]
        config: JsonMap,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateLeadConfig {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub phone_field: Option<String>,
    #[serde(default)]
    pub email_field: Option<String>,
}

// ── End users ───────────────────────────────────────────────────

/// Profile of one end user of one bot, keyed by Telegram user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub telegram_id: i64,
    pub bot_id: String,
    pub chat_id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_data: JsonMap,
    #[serde(default)]
    pub lead_id: Option<String>,
}

impl UserProfile {
    pub fn new(bot_id: impl Into<String>, telegram_id: i64, chat_id: i64) -> Self {
        Self {
            telegram_id,
            bot_id: bot_id.into(),
            chat_id,
            first_name: None,
            last_name: None,
            username: None,
            phone: None,
            email: None,
            language_code: None,
            is_premium: false,
            tags: Vec::new(),
            custom_data: JsonMap::new(),
            lead_id: None,
        }
    }

    pub fn full_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => String::new(),
        }
    }
}

// ── Continuation state ──────────────────────────────────────────

/// What kind of inbound update the engine expects next from a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitingFor {
    #[default]
    None,
    Input(InputKind),
    SubscribeCheck,
    QuizAnswer,
}

impl WaitingFor {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingFor::None => "none",
            WaitingFor::Input(kind) => kind.as_str(),
            WaitingFor::SubscribeCheck => "subscribe_check",
            WaitingFor::QuizAnswer => "quiz_answer",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "none" | "" => WaitingFor::None,
            "subscribe_check" => WaitingFor::SubscribeCheck,
            "quiz_answer" => WaitingFor::QuizAnswer,
            other => InputKind::from_str(other)
                .map(WaitingFor::Input)
                .unwrap_or(WaitingFor::None),
        }
    }
}

/// Per-(bot, user) continuation token. Created lazily on first contact,
/// mutated on every step transition, reset on completion or cancel.
#[derive(Debug, Clone)]
pub struct UserState {
    pub bot_id: String,
    pub user_id: i64,
    pub current_funnel_id: Option<String>,
    pub current_step_id: Option<String>,
    pub collected_data: JsonMap,
    pub waiting_for: WaitingFor,
    pub last_message_id: Option<i64>,
    pub last_chat_id: Option<i64>,
    pub context: JsonMap,
}

impl UserState {
    pub fn idle(bot_id: impl Into<String>, user_id: i64) -> Self {
        Self {
            bot_id: bot_id.into(),
            user_id,
            current_funnel_id: None,
            current_step_id: None,
            collected_data: JsonMap::new(),
            waiting_for: WaitingFor::None,
            last_message_id: None,
            last_chat_id: None,
            context: JsonMap::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_for != WaitingFor::None
    }

    pub fn in_funnel(&self) -> bool {
        self.current_funnel_id.is_some()
    }

    /// Back to idle: no funnel, no step, nothing collected, not waiting.
    pub fn reset(&mut self) {
        self.current_funnel_id = None;
        self.current_step_id = None;
        self.collected_data = JsonMap::new();
        self.waiting_for = WaitingFor::None;
        self.context = JsonMap::new();
    }

    /// Enter a funnel at the given step, clearing prior run data.
    pub fn enter(&mut self, funnel_id: &str, step_id: &str) {
        self.current_funnel_id = Some(funnel_id.to_string());
        self.current_step_id = Some(step_id.to_string());
        self.collected_data = JsonMap::new();
        self.waiting_for = WaitingFor::None;
        self.context = JsonMap::new();
    }
}

// ── Conversations ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Handoff,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Handoff => "handoff",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "handoff" => ConversationStatus::Handoff,
            "closed" => ConversationStatus::Closed,
            _ => ConversationStatus::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub bot_id: String,
    pub user_id: i64,
    pub status: ConversationStatus,
    pub started_funnel_id: Option<String>,
    pub lead_id: Option<String>,
}

impl Conversation {
    pub fn is_handoff(&self) -> bool {
        self.status == ConversationStatus::Handoff
    }
}

// ── Triggers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Command,
    Keyword,
    Callback,
    StartPayload,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Command => "command",
            TriggerKind::Keyword => "keyword",
            TriggerKind::Callback => "callback",
            TriggerKind::StartPayload => "start_payload",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "command" => TriggerKind::Command,
            // Legacy rows may carry "text" for keyword triggers.
            "keyword" | "text" => TriggerKind::Keyword,
            "callback" => TriggerKind::Callback,
            "start_payload" => TriggerKind::StartPayload,
            _ => return None,
        })
    }
}

/// A standalone entry-point rule: command, keyword, callback data, or
/// deep-link payload, optionally pointing at a funnel and/or step.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub kind: TriggerKind,
    pub value: String,
    pub match_mode: MatchMode,
    pub funnel_id: Option<String>,
    pub step_id: Option<String>,
    pub priority: i64,
    pub is_active: bool,
}

// ── Leads ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Lead {
    pub id: String,
    pub business_id: String,
    pub source_id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub status: String,
    pub notes: String,
    pub data: JsonMap,
}

#[derive(Debug, Clone)]
pub struct LeadSource {
    pub id: String,
    pub business_id: String,
    pub code: String,
    pub name: String,
    pub category: String,
    pub is_active: bool,
}

// ── Stats ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyCounter {
    MessagesIn,
    MessagesOut,
    ConversationsStarted,
    LeadsCaptured,
    Handoffs,
}

impl DailyCounter {
    pub fn column(&self) -> &'static str {
        match self {
            DailyCounter::MessagesIn => "messages_in",
            DailyCounter::MessagesOut => "messages_out",
            DailyCounter::ConversationsStarted => "conversations_started",
            DailyCounter::LeadsCaptured => "leads_captured",
            DailyCounter::Handoffs => "handoffs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelCounter {
    Started,
    Completed,
    Leads,
}

impl FunnelCounter {
    pub fn key(&self) -> &'static str {
        match self {
            FunnelCounter::Started => "started",
            FunnelCounter::Completed => "completed",
            FunnelCounter::Leads => "leads",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_config_tagged_roundtrip() {
        let config = StepConfig::Quiz(QuizConfig {
            question: "Pick one".into(),
            options: vec![QuizOption {
                text: "A".into(),
                next_step_id: Some("s2".into()),
            }],
            save_answer_to: None,
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["step_type"], "quiz");
        assert_eq!(json["question"], "Pick one");
        let back: StepConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(back, StepConfig::Quiz(_)));
    }

    #[test]
    fn unknown_condition_operator_parses_to_unknown() {
        let clause: ConditionClause = serde_json::from_str(
            r#"{"field": "phone", "operator": "resembles", "value": "998"}"#,
        )
        .unwrap();
        assert_eq!(clause.operator, ConditionOp::Unknown);
    }

    #[test]
    fn waiting_for_string_roundtrip() {
        for wf in [
            WaitingFor::None,
            WaitingFor::Input(InputKind::Email),
            WaitingFor::Input(InputKind::Photo),
            WaitingFor::SubscribeCheck,
            WaitingFor::QuizAnswer,
        ] {
            assert_eq!(WaitingFor::parse(wf.as_str()), wf);
        }
        assert_eq!(WaitingFor::parse("garbage"), WaitingFor::None);
    }

    #[test]
    fn state_enter_clears_prior_run() {
        let mut state = UserState::idle("bot1", 42);
        state
            .collected_data
            .insert("name".into(), Value::String("Ada".into()));
        state.waiting_for = WaitingFor::Input(InputKind::Text);
        state.enter("f1", "s1");
        assert!(state.collected_data.is_empty());
        assert_eq!(state.waiting_for, WaitingFor::None);
        assert_eq!(state.current_funnel_id.as_deref(), Some("f1"));
        assert_eq!(state.current_step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn field_name_defaults_to_step_name() {
        let mut step = Step {
            id: "s1".into(),
            funnel_id: "f1".into(),
            name: "email".into(),
            config: StepConfig::Content(ContentConfig::text("Your email?")),
            input: Some(InputSpec::new(InputKind::Email)),
            next_step_id: None,
            action: None,
        };
        assert_eq!(step.field_name(), "email");
        step.input.as_mut().unwrap().field = Some("work_email".into());
        assert_eq!(step.field_name(), "work_email");
    }

    #[test]
    fn outgoing_edges_cover_branch_kinds() {
        let step = Step {
            id: "s1".into(),
            funnel_id: "f1".into(),
            name: "branch".into(),
            config: StepConfig::Condition(ConditionConfig {
                clause: ConditionClause {
                    field: "phone".into(),
                    operator: ConditionOp::IsSet,
                    value: Value::Null,
                },
                true_step_id: Some("yes".into()),
                false_step_id: Some("no".into()),
            }),
            input: None,
            next_step_id: Some("after".into()),
            action: None,
        };
        let edges = step.outgoing_edges();
        assert!(edges.contains(&"after"));
        assert!(edges.contains(&"yes"));
        assert!(edges.contains(&"no"));
    }

    #[test]
    fn full_name_composition() {
        let mut user = UserProfile::new("bot1", 7, 7);
        assert_eq!(user.full_name(), "");
        user.first_name = Some("Ada".into());
        assert_eq!(user.full_name(), "Ada");
        user.last_name = Some("Lovelace".into());
        assert_eq!(user.full_name(), "Ada Lovelace");
    }
}
