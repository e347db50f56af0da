use super::actions::{self, LeadQuota, UnlimitedQuota};
use super::callback::CallbackAction;
use super::db::{FunnelDb, MessageRecord};
use super::input;
use super::state::{Pacing, UserLocks};
use super::types::{
    AbVariant, ActionSpec, BotSettings, ButtonAction, ConditionClause, ConditionConfig,
    ConditionOp, ContentConfig, Conversation, ConversationStatus, CreateLeadConfig, DailyCounter,
    FunnelCounter, InlineButtonSpec, InputKind, InputSpec, JsonMap, KeyboardSpec, MessageBody,
    QuizConfig, ReplyButtonSpec, Step, StepConfig, SubscribeCheckConfig, TagAction, TagConfig,
    Trigger, UserProfile, UserState, WaitingFor,
};
use super::vars::{interpolate, VarScope};
use crate::channels::telegram::TelegramChannel;
use crate::channels::telegram_types::{
    CallbackQuery, ContactPayload, IncomingMessage, InlineButton, Keyboard, ReplyButton, Sender,
    Update,
};
use crate::channels::traits::BotApi;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CANCELLED_MESSAGE: &str = "Process cancelled.";
const NOTHING_TO_CANCEL_MESSAGE: &str = "Nothing in progress right now.";
const SHARE_PHONE_BUTTON: &str = "\u{1F4F1} Share phone number";
const SHARE_PHONE_PROMPT: &str = "Share your phone number to continue:";
const JOIN_PROMPT: &str = "Please join the channel to continue!";
const JOIN_BUTTON: &str = "Join channel";
const RECHECK_BUTTON: &str = "Check \u{2713}";
const SUBSCRIBED_TOAST: &str = "\u{2705} Subscription confirmed!";
const SUBSCRIBED_MESSAGE: &str = "\u{2705} Subscription confirmed! Moving on...";
const NOT_SUBSCRIBED_ALERT: &str = "\u{274C} You have not joined the channel yet!";

/// What a step execution tells the interpreter loop to do next.
enum StepFlow {
    /// The step expects input; stop and wait for the next update.
    Await,
    /// Continue to another step after a pacing delay.
    Goto { step_id: String, delay: Duration },
    /// No further step: run the step's terminal action and finalize.
    Act,
    /// Dead end; leave the conversation where it is.
    Halt,
}

/// The funnel execution engine. One instance serves all bots; per-call
/// state lives in a [`Session`] assembled for each inbound update.
pub struct FunnelEngine {
    db: Arc<FunnelDb>,
    quota: Arc<dyn LeadQuota>,
    pacing: Pacing,
    locks: UserLocks,
}

impl FunnelEngine {
    pub fn new(db: Arc<FunnelDb>) -> Self {
        Self {
            db,
            quota: Arc::new(UnlimitedQuota),
            pacing: Pacing::default(),
            locks: UserLocks::new(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn LeadQuota>) -> Self {
        self.quota = quota;
        self
    }

    /// Process one webhook delivery. Serialized per (bot, user): a second
    /// delivery for the same pair queues until the first finishes.
    pub async fn handle_update(
        &self,
        api: &dyn BotApi,
        bot: &BotSettings,
        update: &Update,
    ) -> anyhow::Result<()> {
        if let Some(ref message) = update.message {
            let Some(ref from) = message.from else {
                return Ok(());
            };
            if from.is_bot {
                return Ok(());
            }
            let lock = self.locks.acquire(&bot.id, from.id);
            let _guard = lock.lock().await;
            let mut session = self.session(api, bot, from, message.chat.id)?;
            session.process_message(message).await
        } else if let Some(ref cb) = update.callback_query {
            if cb.from.is_bot {
                return Ok(());
            }
            let chat_id = cb
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .unwrap_or(cb.from.id);
            let lock = self.locks.acquire(&bot.id, cb.from.id);
            let _guard = lock.lock().await;
            let mut session = self.session(api, bot, &cb.from, chat_id)?;
            session.process_callback(cb).await
        } else {
            Ok(())
        }
    }

    /// Load-or-create the profile, continuation state, and open
    /// conversation for a (bot, user) pair.
    fn session<'a>(
        &'a self,
        api: &'a dyn BotApi,
        bot: &'a BotSettings,
        from: &Sender,
        chat_id: i64,
    ) -> anyhow::Result<Session<'a>> {
        let mut user = self
            .db
            .get_user(&bot.id, from.id)?
            .unwrap_or_else(|| UserProfile::new(&bot.id, from.id, chat_id));
        // Platform identity fields are authoritative on every update.
        user.chat_id = chat_id;
        user.first_name = from.first_name.clone().or(user.first_name);
        user.last_name = from.last_name.clone().or(user.last_name);
        user.username = from.username.clone().or(user.username);
        user.language_code = from.language_code.clone().or(user.language_code);
        user.is_premium = from.is_premium;
        self.db.upsert_user(&user)?;

        let state = self
            .db
            .get_state(&bot.id, from.id)?
            .unwrap_or_else(|| UserState::idle(&bot.id, from.id));

        let conversation = match self.db.open_conversation(&bot.id, from.id)? {
            Some(conversation) => conversation,
            None => {
                let conversation = Conversation {
                    id: Uuid::new_v4().to_string(),
                    bot_id: bot.id.clone(),
                    user_id: from.id,
                    status: ConversationStatus::Active,
                    started_funnel_id: None,
                    lead_id: None,
                };
                self.db.insert_conversation(&conversation)?;
                self.db
                    .increment_daily(&bot.id, DailyCounter::ConversationsStarted)?;
                conversation
            }
        };

        Ok(Session {
            engine: self,
            api,
            bot,
            user,
            state,
            conversation,
        })
    }
}

/// One inbound update's unit of work: the engine plus the mutable
/// per-user records it operates on.
struct Session<'a> {
    engine: &'a FunnelEngine,
    api: &'a dyn BotApi,
    bot: &'a BotSettings,
    user: UserProfile,
    state: UserState,
    conversation: Conversation,
}

impl Session<'_> {
    fn db(&self) -> &FunnelDb {
        &self.engine.db
    }

    fn pacing(&self) -> Pacing {
        self.engine.pacing
    }

    fn persist_state(&self) -> anyhow::Result<()> {
        self.db().save_state(&self.state)
    }

    fn scope(&self) -> VarScope<'_> {
        VarScope {
            user: &self.user,
            bot: self.bot,
            collected: &self.state.collected_data,
        }
    }

    async fn typing(&self) {
        if self.bot.typing_action {
            if let Err(e) = self.api.send_chat_action(self.user.chat_id, "typing").await {
                tracing::debug!(error = %e, "typing action failed");
            }
            Pacing::pause(self.pacing().typing).await;
        }
    }

    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.api
            .send_message(self.user.chat_id, text, None)
            .await?;
        Ok(())
    }

    // ── Inbound messages ─────────────────────────────────────────

    async fn process_message(&mut self, message: &IncomingMessage) -> anyhow::Result<()> {
        tracing::info!(
            bot_id = %self.bot.id,
            user_id = self.user.telegram_id,
            text = message.text_or_caption(),
            is_command = message.is_command(),
            "processing message"
        );

        self.log_incoming(message)?;
        self.db()
            .increment_daily(&self.bot.id, DailyCounter::MessagesIn)?;

        // A human operator owns the conversation.
        if self.conversation.is_handoff() {
            return Ok(());
        }

        self.typing().await;

        // Cancel works even mid-input.
        if command_of(message).as_deref() == Some("/cancel") {
            return self.cancel_funnel().await;
        }

        if self.state.is_waiting() {
            return self.process_input(message).await;
        }

        if let Some(ref contact) = message.contact {
            return self.handle_contact(contact).await;
        }

        if message.is_command() {
            return self.process_command(message).await;
        }

        let text = message.text_or_caption().to_string();

        let triggers = self.db().keyword_triggers(&self.bot.id)?;
        if let Some(trigger) = triggers.iter().find(|t| t.matches(&text)) {
            return self.process_trigger(trigger).await;
        }

        if let Some((funnel_id, marker)) = self.find_funnel_by_keyword(&text)? {
            return self.start_funnel_from_marker(&funnel_id, &marker).await;
        }

        let fallback = self.bot.fallback_message.clone();
        self.send_text(&fallback).await
    }

    async fn process_command(&mut self, message: &IncomingMessage) -> anyhow::Result<()> {
        let text = message.text.clone().unwrap_or_default();
        let (command, args) = parse_command(&text);

        if command == "/start" {
            return self.handle_start(args).await;
        }

        if let Some(trigger) = self.db().command_trigger(&self.bot.id, &command)? {
            return self.process_trigger(&trigger).await;
        }

        match command.as_str() {
            "/help" => {
                let help = self.bot.help_message.clone();
                self.send_text(&help).await
            }
            "/cancel" => self.cancel_funnel().await,
            _ => {
                let fallback = self.bot.fallback_message.clone();
                self.send_text(&fallback).await
            }
        }
    }

    /// `/start` resolution chain: deep-link payload trigger, `/start`
    /// command trigger, the bot's default funnel, the first active
    /// funnel, then the static welcome message.
    async fn handle_start(&mut self, payload: Option<String>) -> anyhow::Result<()> {
        tracing::info!(
            bot_id = %self.bot.id,
            user_id = self.user.telegram_id,
            payload = payload.as_deref(),
            "handling /start"
        );

        if let Some(ref payload) = payload {
            if let Some(trigger) = self.db().start_payload_trigger(&self.bot.id, payload)? {
                return self.process_trigger(&trigger).await;
            }
        }

        if let Some(trigger) = self.db().command_trigger(&self.bot.id, "/start")? {
            return self.process_trigger(&trigger).await;
        }

        if let Some(ref funnel_id) = self.bot.default_funnel_id.clone() {
            if let Some(funnel) = self.db().get_funnel(funnel_id)? {
                if funnel.is_active {
                    return self.start_funnel(funnel_id, None).await;
                }
            }
        }

        if let Some(funnel) = self.db().first_active_funnel(&self.bot.id)? {
            return self.start_funnel(&funnel.id, None).await;
        }

        let welcome = self.bot.welcome_message.clone();
        if self.bot.request_contact_on_start && self.user.phone.is_none() {
            let keyboard = Keyboard::Reply {
                rows: vec![vec![ReplyButton::RequestContact(SHARE_PHONE_BUTTON.into())]],
                one_time: true,
                placeholder: Some(SHARE_PHONE_PROMPT.into()),
            };
            self.api
                .send_message(
                    self.user.chat_id,
                    &format!("{welcome}\n\n{SHARE_PHONE_PROMPT}"),
                    Some(&keyboard),
                )
                .await?;
            Ok(())
        } else {
            self.send_text(&welcome).await
        }
    }

    async fn process_trigger(&mut self, trigger: &Trigger) -> anyhow::Result<()> {
        self.db()
            .increment_trigger_stat(&self.bot.id, &trigger.id)?;

        if let Some(ref funnel_id) = trigger.funnel_id {
            self.start_funnel(funnel_id, trigger.step_id.as_deref())
                .await
        } else if let Some(ref step_id) = trigger.step_id {
            self.run_from(step_id.clone()).await
        } else {
            Ok(())
        }
    }

    /// Scan active funnels for a `trigger_keyword` entry marker that
    /// matches the message text. First structural match wins.
    fn find_funnel_by_keyword(&self, text: &str) -> anyhow::Result<Option<(String, Step)>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        for funnel in self.db().active_funnels(&self.bot.id)? {
            for step in self.db().trigger_keyword_steps(&funnel.id)? {
                if let StepConfig::TriggerKeyword(ref spec) = step.config {
                    if spec.matches(text) {
                        tracing::info!(
                            funnel_id = %funnel.id,
                            step_id = %step.id,
                            "keyword entry marker matched"
                        );
                        return Ok(Some((funnel.id, step)));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn start_funnel_from_marker(
        &mut self,
        funnel_id: &str,
        marker: &Step,
    ) -> anyhow::Result<()> {
        self.state.enter(funnel_id, &marker.id);
        self.persist_state()?;
        self.conversation.started_funnel_id = Some(funnel_id.to_string());
        self.db().update_conversation(&self.conversation)?;
        self.db()
            .increment_funnel_stat(&self.bot.id, funnel_id, FunnelCounter::Started)?;

        match marker.next_step_id.clone() {
            Some(next) => self.run_from(next).await,
            None => {
                // Matched marker with no outgoing edge: nothing is sent.
                tracing::warn!(step_id = %marker.id, "keyword entry step has no next step");
                Ok(())
            }
        }
    }

    // ── Funnel traversal ─────────────────────────────────────────

    async fn start_funnel(&mut self, funnel_id: &str, step_id: Option<&str>) -> anyhow::Result<()> {
        let Some(funnel) = self.db().get_funnel(funnel_id)? else {
            tracing::warn!(funnel_id, "funnel not found");
            return Ok(());
        };
        if !funnel.is_active {
            tracing::warn!(funnel_id, "funnel is inactive");
            return Ok(());
        }

        let step = match step_id.or(funnel.first_step_id.as_deref()) {
            Some(id) => self.db().get_step(id)?,
            None => None,
        };
        let Some(step) = step else {
            tracing::warn!(funnel_id, "funnel has no entry step");
            return Ok(());
        };

        self.state.enter(&funnel.id, &step.id);
        self.persist_state()?;
        self.conversation.started_funnel_id = Some(funnel.id.clone());
        self.db().update_conversation(&self.conversation)?;
        self.db()
            .increment_funnel_stat(&self.bot.id, &funnel.id, FunnelCounter::Started)?;

        self.run_from(step.id).await
    }

    /// The interpreter loop: execute steps, following `goto` edges until
    /// a step awaits input, dead-ends, or hands over to the action
    /// executor. Cyclic graphs are followed as authored.
    async fn run_from(&mut self, start: String) -> anyhow::Result<()> {
        let mut next = Some(start);
        while let Some(step_id) = next.take() {
            let Some(step) = self.db().get_step(&step_id)? else {
                tracing::warn!(step_id = %step_id, "step not found");
                return Ok(());
            };

            self.state.current_step_id = Some(step.id.clone());
            self.state.current_funnel_id = Some(step.funnel_id.clone());
            self.persist_state()?;

            match self.execute_step(&step).await? {
                StepFlow::Await | StepFlow::Halt => {}
                StepFlow::Goto { step_id, delay } => {
                    Pacing::pause(delay).await;
                    next = Some(step_id);
                }
                StepFlow::Act => self.run_action(&step).await?,
            }
        }
        Ok(())
    }

    async fn execute_step(&mut self, step: &Step) -> anyhow::Result<StepFlow> {
        match &step.config {
            StepConfig::Content(config) => self.execute_content(step, config).await,
            StepConfig::Condition(config) => self.execute_condition(step, config),
            StepConfig::SubscribeCheck(config) => self.execute_subscribe_check(step, config).await,
            StepConfig::Quiz(config) => self.execute_quiz(step, config).await,
            StepConfig::AbTest(config) => {
                if config.variants.is_empty() {
                    return Ok(StepFlow::Halt);
                }
                let draw = rand::thread_rng().gen_range(1..=100);
                self.apply_ab_variant(step, &config.variants, draw)
            }
            StepConfig::Tag(config) => self.execute_tag(step, config),
            StepConfig::TriggerKeyword(_) => Ok(self.branch_or_halt(step.next_step_id.clone())),
        }
    }

    fn branch_or_halt(&self, next: Option<String>) -> StepFlow {
        match next {
            Some(step_id) => StepFlow::Goto {
                step_id,
                delay: self.pacing().branch,
            },
            None => StepFlow::Halt,
        }
    }

    async fn execute_content(
        &mut self,
        step: &Step,
        config: &ContentConfig,
    ) -> anyhow::Result<StepFlow> {
        let mut body = config.body.clone();
        if let Some(text) = body.text_mut() {
            *text = interpolate(text, &self.scope());
        }
        let keyboard = config
            .keyboard
            .as_ref()
            .map(|spec| self.render_keyboard(spec, step));

        self.typing().await;

        match self
            .api
            .send_media(self.user.chat_id, &body, keyboard.as_ref())
            .await
        {
            Ok(sent) => {
                self.state.last_message_id = Some(sent.message_id);
                self.state.last_chat_id = Some(self.user.chat_id);
                self.persist_state()?;
                self.log_outgoing(step, &body, keyboard.as_ref())?;
                self.db()
                    .increment_daily(&self.bot.id, DailyCounter::MessagesOut)?;
            }
            Err(e) => {
                tracing::error!(step_id = %step.id, error = %e, "failed to send step content");
            }
        }

        if let Some(ref input) = step.input {
            self.state.waiting_for = WaitingFor::Input(input.kind);
            self.persist_state()?;
            return Ok(StepFlow::Await);
        }
        if let Some(next) = step.next_step_id.clone() {
            return Ok(StepFlow::Goto {
                step_id: next,
                delay: self.pacing().step,
            });
        }
        if step.action.is_some() {
            return Ok(StepFlow::Act);
        }
        // No input, no next step, no action: a dead end is a valid,
        // if unproductive, terminal state.
        Ok(StepFlow::Halt)
    }

    fn execute_condition(
        &mut self,
        step: &Step,
        config: &ConditionConfig,
    ) -> anyhow::Result<StepFlow> {
        let result = self.evaluate_condition(&config.clause)?;
        tracing::info!(
            step_id = %step.id,
            field = %config.clause.field,
            result,
            "condition evaluated"
        );
        let branch = if result {
            config.true_step_id.clone()
        } else {
            config.false_step_id.clone()
        };
        Ok(self.branch_or_halt(branch))
    }

    fn evaluate_condition(&self, clause: &ConditionClause) -> anyhow::Result<bool> {
        let actual = self.field_value(&clause.field)?;
        Ok(evaluate_op(clause.operator, actual.as_ref(), &clause.value))
    }

    /// Resolve a condition field: collected data first, then derived
    /// marketing fields, then profile attributes, then the custom bag.
    fn field_value(&self, field: &str) -> anyhow::Result<Option<Value>> {
        if let Some(value) = self.state.collected_data.get(field) {
            return Ok(Some(value.clone()));
        }
        Ok(match field {
            "has_tag" => Some(Value::Bool(!self.user.tags.is_empty())),
            "quiz_answer" => self.state.collected_data.get("quiz_answer").cloned(),
            "interaction_count" => Some(Value::from(
                self.db().message_count(&self.bot.id, self.user.telegram_id)?,
            )),
            "first_name" => self.user.first_name.clone().map(Value::String),
            "last_name" => self.user.last_name.clone().map(Value::String),
            "username" => self.user.username.clone().map(Value::String),
            "phone" => self.user.phone.clone().map(Value::String),
            "email" => self.user.email.clone().map(Value::String),
            "language_code" => self.user.language_code.clone().map(Value::String),
            "is_premium" => Some(Value::Bool(self.user.is_premium)),
            "user_id" => Some(Value::from(self.user.telegram_id)),
            _ => self.user.custom_data.get(field).cloned(),
        })
    }

    async fn execute_subscribe_check(
        &mut self,
        step: &Step,
        config: &SubscribeCheckConfig,
    ) -> anyhow::Result<StepFlow> {
        let Some(channel) = config.channel.as_deref().filter(|c| !c.is_empty()) else {
            // No channel configured: skip through the gate.
            return Ok(match config.true_step_id.clone() {
                Some(step_id) => StepFlow::Goto {
                    step_id,
                    delay: Duration::ZERO,
                },
                None => StepFlow::Halt,
            });
        };

        let subscribed = match self.api.get_chat_member(channel, self.user.telegram_id).await {
            Ok(status) => status.is_subscribed(),
            Err(e) => {
                tracing::warn!(channel, error = %e, "membership query failed");
                false
            }
        };
        tracing::info!(
            user_id = self.user.telegram_id,
            channel,
            subscribed,
            "subscribe check"
        );

        if subscribed {
            return Ok(self.branch_or_halt(config.true_step_id.clone()));
        }

        let prompt = config.prompt.clone().unwrap_or_else(|| JOIN_PROMPT.into());
        let join_text = config
            .join_button_text
            .clone()
            .unwrap_or_else(|| JOIN_BUTTON.into());
        let handle = channel.trim_start_matches('@');
        let keyboard = Keyboard::Inline(vec![
            vec![InlineButton::url(join_text, format!("https://t.me/{handle}"))],
            vec![InlineButton::callback(
                RECHECK_BUTTON,
                CallbackAction::RecheckSubscribe {
                    step_id: step.id.clone(),
                }
                .encode(),
            )],
        ]);
        if let Err(e) = self
            .api
            .send_message(self.user.chat_id, &prompt, Some(&keyboard))
            .await
        {
            tracing::error!(step_id = %step.id, error = %e, "failed to send subscribe prompt");
        }

        self.state.waiting_for = WaitingFor::SubscribeCheck;
        self.persist_state()?;
        Ok(StepFlow::Await)
    }

    async fn execute_quiz(&mut self, step: &Step, config: &QuizConfig) -> anyhow::Result<StepFlow> {
        if config.options.is_empty() {
            tracing::warn!(step_id = %step.id, "quiz step has no options");
            return Ok(StepFlow::Halt);
        }

        let question = interpolate(&config.question, &self.scope());
        let rows: Vec<Vec<InlineButton>> = config
            .options
            .iter()
            .enumerate()
            .map(|(i, option)| {
                vec![InlineButton::callback(
                    option.text.clone(),
                    CallbackAction::QuizAnswer {
                        step_id: step.id.clone(),
                        option_index: i,
                    }
                    .encode(),
                )]
            })
            .collect();

        self.typing().await;

        match self
            .api
            .send_message(self.user.chat_id, &question, Some(&Keyboard::Inline(rows)))
            .await
        {
            Ok(sent) => {
                self.state.last_message_id = Some(sent.message_id);
                self.state.last_chat_id = Some(self.user.chat_id);
                self.state.waiting_for = WaitingFor::QuizAnswer;
                self.persist_state()?;
                Ok(StepFlow::Await)
            }
            Err(e) => {
                tracing::error!(step_id = %step.id, error = %e, "failed to send quiz");
                Ok(StepFlow::Halt)
            }
        }
    }

    /// Record the drawn variant and branch to its next step.
    fn apply_ab_variant(
        &mut self,
        step: &Step,
        variants: &[AbVariant],
        draw: u32,
    ) -> anyhow::Result<StepFlow> {
        let Some(variant) = pick_variant(variants, draw) else {
            return Ok(StepFlow::Halt);
        };
        tracing::info!(
            step_id = %step.id,
            variant = %variant.name,
            draw,
            "A/B variant selected"
        );
        self.state.collected_data.insert(
            format!("ab_test_{}", step.id),
            Value::String(variant.name.clone()),
        );
        self.persist_state()?;
        Ok(self.branch_or_halt(variant.next_step_id.clone()))
    }

    fn execute_tag(&mut self, step: &Step, config: &TagConfig) -> anyhow::Result<StepFlow> {
        if config.tags.is_empty() {
            return Ok(self.branch_or_halt(step.next_step_id.clone()));
        }

        match config.action {
            TagAction::Add => {
                for tag in &config.tags {
                    if !self.user.tags.contains(tag) {
                        self.user.tags.push(tag.clone());
                    }
                }
            }
            TagAction::Remove => {
                self.user.tags.retain(|t| !config.tags.contains(t));
            }
        }
        self.db().upsert_user(&self.user)?;
        tracing::info!(
            user_id = self.user.telegram_id,
            step_id = %step.id,
            tags = ?self.user.tags,
            "user tags updated"
        );

        Ok(self.branch_or_halt(step.next_step_id.clone()))
    }

    fn render_keyboard(&self, spec: &KeyboardSpec, step: &Step) -> Keyboard {
        match spec {
            KeyboardSpec::Inline { rows } => Keyboard::Inline(
                rows.iter()
                    .map(|row| {
                        row.iter()
                            .map(|button| self.render_inline_button(button, step))
                            .collect()
                    })
                    .collect(),
            ),
            KeyboardSpec::Reply {
                rows,
                one_time,
                placeholder,
            } => Keyboard::Reply {
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(render_reply_button).collect())
                    .collect(),
                one_time: *one_time,
                placeholder: placeholder.clone(),
            },
        }
    }

    fn render_inline_button(&self, spec: &InlineButtonSpec, step: &Step) -> InlineButton {
        let data = match &spec.action {
            ButtonAction::Url { url } => return InlineButton::url(spec.text.clone(), url.clone()),
            ButtonAction::Callback { data } => data.clone(),
            ButtonAction::GoToStep { step_id } => CallbackAction::GoToStep {
                step_id: step_id.clone(),
            }
            .encode(),
            ButtonAction::Input { field, value } => CallbackAction::Input {
                field: field
                    .clone()
                    .or_else(|| Some(step.field_name().to_string())),
                value: value.clone(),
            }
            .encode(),
            ButtonAction::NextStep => match step.next_step_id.clone() {
                Some(step_id) => CallbackAction::GoToStep { step_id }.encode(),
                // No outgoing edge: an inert payload the router drops.
                None => "finish".into(),
            },
        };
        InlineButton::callback(spec.text.clone(), data)
    }

    // ── Input collection ─────────────────────────────────────────

    async fn process_input(&mut self, message: &IncomingMessage) -> anyhow::Result<()> {
        let Some(step_id) = self.state.current_step_id.clone() else {
            self.state.waiting_for = WaitingFor::None;
            self.persist_state()?;
            return Ok(());
        };
        let Some(step) = self.db().get_step(&step_id)? else {
            self.state.waiting_for = WaitingFor::None;
            self.persist_state()?;
            return Ok(());
        };

        let WaitingFor::Input(kind) = self.state.waiting_for else {
            // Waiting on a button press (quiz / subscribe recheck); a
            // plain message is inert until the user presses it.
            tracing::debug!(step_id = %step.id, "message ignored while waiting for a button press");
            return Ok(());
        };

        let spec = step
            .input
            .clone()
            .unwrap_or_else(|| InputSpec::new(kind));

        let Some(value) = input::extract(message, spec.kind) else {
            return self.send_validation_error(&spec).await;
        };
        if !input::validate(&value, &spec) {
            return self.send_validation_error(&spec).await;
        }

        self.state
            .collected_data
            .insert(step.field_name().to_string(), value);

        // A shared contact also refreshes the stored profile.
        if spec.kind == InputKind::Phone {
            if let Some(ref contact) = message.contact {
                self.user.phone = Some(contact.phone_number.clone());
                if let Some(ref first) = contact.first_name {
                    self.user.first_name = Some(first.clone());
                }
                if let Some(ref last) = contact.last_name {
                    self.user.last_name = Some(last.clone());
                }
                self.db().upsert_user(&self.user)?;
            }
        }

        self.state.waiting_for = WaitingFor::None;
        self.persist_state()?;

        if let Some(next) = step.next_step_id.clone() {
            self.run_from(next).await
        } else if step.action.is_some() {
            self.run_action(&step).await
        } else {
            Ok(())
        }
    }

    /// Invalid input: resend the error text, leave the wait in place.
    async fn send_validation_error(&self, spec: &InputSpec) -> anyhow::Result<()> {
        let text = spec
            .error_message
            .clone()
            .unwrap_or_else(|| self.bot.validation_error_message.clone());
        self.send_text(&text).await
    }

    async fn process_callback_input(
        &mut self,
        field: Option<String>,
        value: String,
    ) -> anyhow::Result<()> {
        let Some(step_id) = self.state.current_step_id.clone() else {
            return Ok(());
        };
        let Some(step) = self.db().get_step(&step_id)? else {
            return Ok(());
        };

        let field = field.unwrap_or_else(|| step.field_name().to_string());
        self.state.collected_data.insert(field, Value::String(value));
        self.state.waiting_for = WaitingFor::None;
        self.persist_state()?;

        if let Some(next) = step.next_step_id.clone() {
            self.run_from(next).await
        } else if step.action.is_some() {
            self.run_action(&step).await
        } else {
            Ok(())
        }
    }

    // ── Callbacks ────────────────────────────────────────────────

    async fn process_callback(&mut self, cb: &CallbackQuery) -> anyhow::Result<()> {
        self.state
            .context
            .insert("last_callback_id".into(), Value::String(cb.id.clone()));
        self.persist_state()?;
        self.log_callback(cb)?;

        if self.conversation.is_handoff() {
            self.answer_quietly(&cb.id).await;
            return Ok(());
        }

        let data = cb.data.clone().unwrap_or_default();
        let mut acknowledge = true;

        match CallbackAction::decode(&data) {
            Some(CallbackAction::GoToStep { step_id }) => self.run_from(step_id).await?,
            Some(CallbackAction::StartFunnel { funnel_id }) => {
                self.start_funnel(&funnel_id, None).await?
            }
            Some(CallbackAction::Input { field, value }) => {
                self.process_callback_input(field, value).await?
            }
            Some(CallbackAction::Handoff { reason }) => {
                self.request_handoff(reason.as_deref()).await?
            }
            Some(CallbackAction::Restart) => self.restart_funnel().await?,
            Some(CallbackAction::QuizAnswer {
                step_id,
                option_index,
            }) => self.process_quiz_answer(&step_id, option_index).await?,
            Some(CallbackAction::RecheckSubscribe { step_id }) => {
                // Manages its own acknowledgement, including the alert.
                self.recheck_subscription(&step_id, &cb.id).await?;
                acknowledge = false;
            }
            None => {
                if let Some(trigger) = self.db().callback_trigger(&self.bot.id, &data)? {
                    self.process_trigger(&trigger).await?;
                }
            }
        }

        if acknowledge {
            self.answer_quietly(&cb.id).await;
        }
        Ok(())
    }

    async fn answer_quietly(&self, callback_id: &str) {
        if let Err(e) = self.api.answer_callback(callback_id, None, false).await {
            tracing::debug!(error = %e, "answer_callback failed");
        }
    }

    async fn process_quiz_answer(
        &mut self,
        step_id: &str,
        option_index: usize,
    ) -> anyhow::Result<()> {
        let Some(step) = self.db().get_step(step_id)? else {
            return Ok(());
        };
        let StepConfig::Quiz(ref quiz) = step.config else {
            return Ok(());
        };
        let Some(option) = quiz.options.get(option_index) else {
            return Ok(());
        };

        tracing::info!(
            user_id = self.user.telegram_id,
            step_id,
            option_index,
            option = %option.text,
            "quiz answer received"
        );

        let field = quiz
            .save_answer_to
            .clone()
            .unwrap_or_else(|| "quiz_answer".into());
        self.state
            .collected_data
            .insert(field.clone(), Value::String(option.text.clone()));
        self.state
            .collected_data
            .insert(format!("{field}_index"), Value::from(option_index as i64));
        self.state.waiting_for = WaitingFor::None;
        self.persist_state()?;

        let next = option.next_step_id.clone().or_else(|| step.next_step_id.clone());
        if let Some(next) = next {
            Pacing::pause(self.pacing().branch).await;
            self.run_from(next).await?;
        }
        Ok(())
    }

    async fn recheck_subscription(
        &mut self,
        step_id: &str,
        callback_id: &str,
    ) -> anyhow::Result<()> {
        let step = self.db().get_step(step_id)?;
        let config = match step {
            Some(ref step) => match step.config {
                StepConfig::SubscribeCheck(ref config) => config.clone(),
                _ => {
                    self.answer_quietly(callback_id).await;
                    return Ok(());
                }
            },
            None => {
                self.answer_quietly(callback_id).await;
                return Ok(());
            }
        };
        let Some(channel) = config.channel.as_deref().filter(|c| !c.is_empty()) else {
            self.answer_quietly(callback_id).await;
            return Ok(());
        };

        let subscribed = match self.api.get_chat_member(channel, self.user.telegram_id).await {
            Ok(status) => status.is_subscribed(),
            Err(e) => {
                tracing::warn!(channel, error = %e, "membership recheck failed");
                false
            }
        };
        tracing::info!(
            user_id = self.user.telegram_id,
            channel,
            subscribed,
            "recheck subscription"
        );

        if subscribed {
            if let Err(e) = self
                .api
                .answer_callback(callback_id, Some(SUBSCRIBED_TOAST), false)
                .await
            {
                tracing::debug!(error = %e, "answer_callback failed");
            }
            self.send_text(SUBSCRIBED_MESSAGE).await?;
            self.state.waiting_for = WaitingFor::None;
            self.persist_state()?;

            if let Some(next) = config.true_step_id.clone() {
                Pacing::pause(self.pacing().step).await;
                self.run_from(next).await?;
            }
        } else {
            // Still not a member: blocking alert, same wait persists.
            self.api
                .answer_callback(callback_id, Some(NOT_SUBSCRIBED_ALERT), true)
                .await?;
        }
        Ok(())
    }

    // ── Terminal actions ─────────────────────────────────────────

    /// Run the step's action (if any), then finalize unconditionally.
    /// Action failures are logged, never surfaced, never rolled back.
    async fn run_action(&mut self, step: &Step) -> anyhow::Result<()> {
        if let Some(action) = step.action.clone() {
            if let Err(e) = self.execute_action(step, &action).await {
                tracing::error!(step_id = %step.id, error = %e, "action failed");
            }
        }
        self.complete_funnel().await
    }

    async fn execute_action(&mut self, step: &Step, action: &ActionSpec) -> anyhow::Result<()> {
        match action {
            ActionSpec::CreateLead(config) => self.create_lead(config).await,
            ActionSpec::UpdateUser { field_mapping } => {
                self.update_user_from_collected(field_mapping)
            }
            ActionSpec::Handoff { reason } => self.request_handoff(reason.as_deref()).await,
            // Audit-log-only extension points; no outbound delivery.
            ActionSpec::SendNotification { config } => {
                tracing::info!(
                    step_id = %step.id,
                    user_id = self.user.telegram_id,
                    config = ?config,
                    collected = ?self.state.collected_data,
                    "funnel notification hook"
                );
                Ok(())
            }
            ActionSpec::Webhook { config } => {
                tracing::info!(
                    step_id = %step.id,
                    user_id = self.user.telegram_id,
                    config = ?config,
                    collected = ?self.state.collected_data,
                    "funnel webhook hook"
                );
                Ok(())
            }
        }
    }

    async fn create_lead(&mut self, config: &CreateLeadConfig) -> anyhow::Result<()> {
        if !self.engine.quota.can_add_lead(&self.bot.business_id) {
            // Automated background action: the user gets no message.
            tracing::warn!(
                business_id = %self.bot.business_id,
                bot_id = %self.bot.id,
                user_id = self.user.telegram_id,
                "lead creation blocked: monthly quota exhausted"
            );
            return Ok(());
        }

        let source_id = match config.source_id.clone() {
            Some(id) => Some(id),
            None => actions::resolve_lead_source(self.db(), &self.bot.business_id).map(|s| s.id),
        };

        let funnel_id = self.state.current_funnel_id.clone();
        let funnel_name = match funnel_id.as_deref() {
            Some(id) => self.db().get_funnel(id)?.map(|f| f.name),
            None => None,
        };

        let lead = actions::build_lead(
            config,
            self.bot,
            &self.user,
            source_id,
            funnel_id.as_deref(),
            funnel_name.as_deref(),
            &self.state.collected_data,
        );
        self.db().insert_lead(&lead)?;

        self.conversation.lead_id = Some(lead.id.clone());
        self.db().update_conversation(&self.conversation)?;
        self.user.lead_id = Some(lead.id.clone());
        self.db().upsert_user(&self.user)?;

        self.db()
            .increment_daily(&self.bot.id, DailyCounter::LeadsCaptured)?;
        if let Some(ref id) = funnel_id {
            self.db()
                .increment_funnel_stat(&self.bot.id, id, FunnelCounter::Leads)?;
        }
        Ok(())
    }

    fn update_user_from_collected(&mut self, field_mapping: &JsonMap) -> anyhow::Result<()> {
        for (source, target) in field_mapping {
            let Some(value) = self.state.collected_data.get(source) else {
                continue;
            };
            let Some(target) = target.as_str() else {
                continue;
            };
            let text = value.as_str().map(str::to_string);
            match target {
                "first_name" => self.user.first_name = text,
                "last_name" => self.user.last_name = text,
                "username" => self.user.username = text,
                "phone" => self.user.phone = text,
                "email" => self.user.email = text,
                "language_code" => self.user.language_code = text,
                _ => {
                    self.user
                        .custom_data
                        .insert(source.clone(), value.clone());
                }
            }
        }
        self.db().upsert_user(&self.user)
    }

    async fn request_handoff(&mut self, reason: Option<&str>) -> anyhow::Result<()> {
        self.conversation.status = ConversationStatus::Handoff;
        self.db().update_conversation(&self.conversation)?;
        self.db()
            .increment_daily(&self.bot.id, DailyCounter::Handoffs)?;
        tracing::info!(
            user_id = self.user.telegram_id,
            reason = reason.unwrap_or(""),
            "conversation handed off to operator"
        );
        let message = self.bot.handoff_message.clone();
        self.send_text(&message).await
    }

    /// Finalize the funnel: completed counter, state reset, optional
    /// interpolated completion message.
    async fn complete_funnel(&mut self) -> anyhow::Result<()> {
        let funnel_id = self.state.current_funnel_id.clone();
        if let Some(ref id) = funnel_id {
            self.db()
                .increment_funnel_stat(&self.bot.id, id, FunnelCounter::Completed)?;
        }

        // Interpolate against the run's data before the reset wipes it.
        let collected = std::mem::take(&mut self.state.collected_data);
        self.state.reset();
        self.persist_state()?;

        if let Some(id) = funnel_id {
            if let Some(funnel) = self.db().get_funnel(&id)? {
                if let Some(ref completion) = funnel.completion_message {
                    let scope = VarScope {
                        user: &self.user,
                        bot: self.bot,
                        collected: &collected,
                    };
                    let text = interpolate(completion, &scope);
                    self.send_text(&text).await?;
                }
            }
        }
        Ok(())
    }

    async fn cancel_funnel(&mut self) -> anyhow::Result<()> {
        if self.state.in_funnel() {
            self.state.reset();
            self.persist_state()?;
            self.send_text(CANCELLED_MESSAGE).await
        } else {
            self.send_text(NOTHING_TO_CANCEL_MESSAGE).await
        }
    }

    async fn restart_funnel(&mut self) -> anyhow::Result<()> {
        if let Some(funnel_id) = self.state.current_funnel_id.clone() {
            self.start_funnel(&funnel_id, None).await
        } else {
            Ok(())
        }
    }

    async fn handle_contact(&mut self, contact: &ContactPayload) -> anyhow::Result<()> {
        if contact.phone_number.is_empty() {
            return Ok(());
        }
        self.user.phone = Some(contact.phone_number.clone());
        if let Some(ref first) = contact.first_name {
            self.user.first_name = Some(first.clone());
        }
        if let Some(ref last) = contact.last_name {
            self.user.last_name = Some(last.clone());
        }
        self.db().upsert_user(&self.user)?;
        tracing::info!(
            bot_id = %self.bot.id,
            user_id = self.user.telegram_id,
            "user phone saved"
        );

        let message = self.bot.contact_received_message.clone();
        self.api
            .send_message(self.user.chat_id, &message, Some(&Keyboard::Remove))
            .await?;
        Ok(())
    }

    // ── Message audit log ────────────────────────────────────────

    fn log_incoming(&self, message: &IncomingMessage) -> anyhow::Result<()> {
        self.db().log_message(&MessageRecord {
            conversation_id: self.conversation.id.clone(),
            bot_id: self.bot.id.clone(),
            user_id: self.user.telegram_id,
            telegram_message_id: Some(message.message_id),
            chat_id: message.chat.id,
            direction: "incoming".into(),
            sender_type: "user".into(),
            content_type: message.content_kind().into(),
            content: Value::Object(message.content_json()),
            keyboard: None,
            funnel_id: self.state.current_funnel_id.clone(),
            step_id: self.state.current_step_id.clone(),
        })?;
        self.db().touch_conversation(&self.conversation.id)
    }

    fn log_outgoing(
        &self,
        step: &Step,
        body: &MessageBody,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<()> {
        self.db().log_message(&MessageRecord {
            conversation_id: self.conversation.id.clone(),
            bot_id: self.bot.id.clone(),
            user_id: self.user.telegram_id,
            telegram_message_id: self.state.last_message_id,
            chat_id: self.user.chat_id,
            direction: "outgoing".into(),
            sender_type: "bot".into(),
            content_type: body.content_type().into(),
            content: serde_json::to_value(body)?,
            keyboard: keyboard.map(TelegramChannel::reply_markup_json),
            funnel_id: self.state.current_funnel_id.clone(),
            step_id: Some(step.id.clone()),
        })?;
        self.db().touch_conversation(&self.conversation.id)
    }

    fn log_callback(&self, cb: &CallbackQuery) -> anyhow::Result<()> {
        let mut content = JsonMap::new();
        content.insert(
            "callback_data".into(),
            Value::String(cb.data.clone().unwrap_or_default()),
        );
        if let Some(text) = cb.message.as_ref().and_then(|m| m.text.clone()) {
            content.insert("message_text".into(), Value::String(text));
        }
        self.db().log_message(&MessageRecord {
            conversation_id: self.conversation.id.clone(),
            bot_id: self.bot.id.clone(),
            user_id: self.user.telegram_id,
            telegram_message_id: cb.message.as_ref().map(|m| m.message_id),
            chat_id: self.user.chat_id,
            direction: "incoming".into(),
            sender_type: "user".into(),
            content_type: "callback_query".into(),
            content: Value::Object(content),
            keyboard: None,
            funnel_id: self.state.current_funnel_id.clone(),
            step_id: self.state.current_step_id.clone(),
        })?;
        self.db().touch_conversation(&self.conversation.id)
    }
}

// ── Pure helpers ────────────────────────────────────────────────

fn render_reply_button(spec: &ReplyButtonSpec) -> ReplyButton {
    match spec {
        ReplyButtonSpec::Text { text } => ReplyButton::Text(text.clone()),
        ReplyButtonSpec::RequestContact { text } => ReplyButton::RequestContact(text.clone()),
        ReplyButtonSpec::RequestLocation { text } => ReplyButton::RequestLocation(text.clone()),
    }
}

fn parse_command(text: &str) -> (String, Option<String>) {
    let mut parts = text.splitn(2, ' ');
    let mut command = parts.next().unwrap_or_default();
    // Strip an @botname suffix.
    if let Some(at) = command.find('@') {
        command = &command[..at];
    }
    let args = parts
        .next()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    (command.to_lowercase(), args)
}

fn command_of(message: &IncomingMessage) -> Option<String> {
    message
        .is_command()
        .then(|| parse_command(message.text.as_deref().unwrap_or_default()).0)
}

/// Cumulative-weight selection over a uniform draw in [1, 100]. Ties go
/// to list order; a draw past the last cumulative weight (rounding gaps)
/// falls back to the first variant.
pub fn pick_variant(variants: &[AbVariant], draw: u32) -> Option<&AbVariant> {
    let mut cumulative = 0u32;
    for variant in variants {
        cumulative += variant.weight;
        if draw <= cumulative {
            return Some(variant);
        }
    }
    variants.first()
}

/// Evaluate a condition operator against the resolved field value.
/// `None` means the field is unset. Unknown operators are always false.
pub(crate) fn evaluate_op(op: ConditionOp, actual: Option<&Value>, expected: &Value) -> bool {
    match op {
        ConditionOp::Equals => loose_eq(actual, expected),
        ConditionOp::NotEquals => !loose_eq(actual, expected),
        ConditionOp::Contains => {
            string_pair(actual, expected).is_some_and(|(a, e)| a.contains(&e))
        }
        ConditionOp::NotContains => {
            string_pair(actual, expected).is_some_and(|(a, e)| !a.contains(&e))
        }
        ConditionOp::StartsWith => {
            string_pair(actual, expected).is_some_and(|(a, e)| a.starts_with(&e))
        }
        ConditionOp::EndsWith => {
            string_pair(actual, expected).is_some_and(|(a, e)| a.ends_with(&e))
        }
        ConditionOp::IsSet => !is_empty_value(actual),
        ConditionOp::IsEmpty => is_empty_value(actual),
        ConditionOp::GreaterThan => numeric_pair(actual, expected).is_some_and(|(a, e)| a > e),
        ConditionOp::LessThan => numeric_pair(actual, expected).is_some_and(|(a, e)| a < e),
        ConditionOp::GreaterOrEqual => {
            numeric_pair(actual, expected).is_some_and(|(a, e)| a >= e)
        }
        ConditionOp::LessOrEqual => numeric_pair(actual, expected).is_some_and(|(a, e)| a <= e),
        ConditionOp::IsTrue => truthy(actual),
        ConditionOp::IsFalse => !truthy(actual),
        ConditionOp::Unknown => false,
    }
}

/// Loose equality: numeric when both sides parse, textual otherwise.
fn loose_eq(actual: Option<&Value>, expected: &Value) -> bool {
    if let (Some(a), Some(e)) = (actual.and_then(as_number), as_number(expected)) {
        return a == e;
    }
    match (actual.and_then(coerce_string), coerce_string(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => false,
    }
}

/// String operators require a string actual value (case-insensitive).
fn string_pair(actual: Option<&Value>, expected: &Value) -> Option<(String, String)> {
    let a = actual?.as_str()?.to_lowercase();
    let e = coerce_string(expected)?.to_lowercase();
    Some((a, e))
}

fn numeric_pair(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((actual.and_then(as_number)?, as_number(expected)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Emptiness in the permissive sense: unset, null, blank, zero, false,
/// "0", or an empty collection.
fn is_empty_value(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty() || s == "0",
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
    }
}

/// Boolean coercion: true, 1, "1", "true", "on", "yes" count as true.
fn truthy(actual: Option<&Value>) -> bool {
    match actual {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::String(s)) => {
            matches!(s.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variants(weights: &[u32]) -> Vec<AbVariant> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| AbVariant {
                name: format!("V{i}"),
                weight,
                next_step_id: None,
            })
            .collect()
    }

    #[test]
    fn pick_variant_boundaries() {
        let vs = variants(&[30, 70]);
        assert_eq!(pick_variant(&vs, 1).unwrap().name, "V0");
        assert_eq!(pick_variant(&vs, 30).unwrap().name, "V0");
        assert_eq!(pick_variant(&vs, 31).unwrap().name, "V1");
        assert_eq!(pick_variant(&vs, 100).unwrap().name, "V1");
    }

    #[test]
    fn pick_variant_rounding_gap_falls_back_to_first() {
        let vs = variants(&[20, 20]);
        assert_eq!(pick_variant(&vs, 90).unwrap().name, "V0");
    }

    #[test]
    fn pick_variant_empty_is_none() {
        assert!(pick_variant(&[], 50).is_none());
    }

    #[test]
    fn equals_is_loose_across_types() {
        assert!(evaluate_op(
            ConditionOp::Equals,
            Some(&json!("5")),
            &json!(5)
        ));
        assert!(evaluate_op(
            ConditionOp::Equals,
            Some(&json!("yes")),
            &json!("yes")
        ));
        assert!(!evaluate_op(
            ConditionOp::Equals,
            Some(&json!("ABC")),
            &json!("abc")
        ));
        assert!(evaluate_op(
            ConditionOp::NotEquals,
            Some(&json!("a")),
            &json!("b")
        ));
    }

    #[test]
    fn string_operators_are_case_insensitive() {
        assert!(evaluate_op(
            ConditionOp::Contains,
            Some(&json!("Hello World")),
            &json!("WORLD")
        ));
        assert!(evaluate_op(
            ConditionOp::StartsWith,
            Some(&json!("Hello World")),
            &json!("hello")
        ));
        assert!(evaluate_op(
            ConditionOp::EndsWith,
            Some(&json!("Hello World")),
            &json!("world")
        ));
        // Non-string actual values never match string operators.
        assert!(!evaluate_op(
            ConditionOp::Contains,
            Some(&json!(42)),
            &json!("4")
        ));
    }

    #[test]
    fn is_empty_on_unset_field_is_true() {
        assert!(evaluate_op(ConditionOp::IsEmpty, None, &Value::Null));
        assert!(!evaluate_op(ConditionOp::IsSet, None, &Value::Null));
        assert!(evaluate_op(
            ConditionOp::IsSet,
            Some(&json!("x")),
            &Value::Null
        ));
        assert!(evaluate_op(
            ConditionOp::IsEmpty,
            Some(&json!("")),
            &Value::Null
        ));
        assert!(evaluate_op(
            ConditionOp::IsEmpty,
            Some(&json!("0")),
            &Value::Null
        ));
    }

    #[test]
    fn greater_than_on_non_numeric_is_false() {
        assert!(!evaluate_op(
            ConditionOp::GreaterThan,
            Some(&json!("abc")),
            &json!(5)
        ));
        assert!(evaluate_op(
            ConditionOp::GreaterThan,
            Some(&json!("10")),
            &json!(5)
        ));
        assert!(evaluate_op(
            ConditionOp::GreaterOrEqual,
            Some(&json!(5)),
            &json!(5)
        ));
        assert!(evaluate_op(
            ConditionOp::LessThan,
            Some(&json!(3)),
            &json!("5")
        ));
        assert!(!evaluate_op(ConditionOp::LessOrEqual, None, &json!(5)));
    }

    #[test]
    fn boolean_coercion() {
        for v in [json!(true), json!("yes"), json!("TRUE"), json!(1), json!("on")] {
            assert!(evaluate_op(ConditionOp::IsTrue, Some(&v), &Value::Null), "{v}");
        }
        for v in [json!(false), json!("no"), json!(0), json!("off"), json!(2)] {
            assert!(evaluate_op(ConditionOp::IsFalse, Some(&v), &Value::Null), "{v}");
        }
        assert!(evaluate_op(ConditionOp::IsFalse, None, &Value::Null));
    }

    #[test]
    fn unknown_operator_is_false() {
        assert!(!evaluate_op(
            ConditionOp::Unknown,
            Some(&json!("anything")),
            &json!("anything")
        ));
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("/start"), ("/start".into(), None));
        assert_eq!(
            parse_command("/start promo2026"),
            ("/start".into(), Some("promo2026".into()))
        );
        assert_eq!(
            parse_command("/Start@MyBot promo"),
            ("/start".into(), Some("promo".into()))
        );
        assert_eq!(parse_command("/help  "), ("/help".into(), None));
    }
}
