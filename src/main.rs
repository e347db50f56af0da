use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use funnelgram::channels::telegram::{verify_webhook_secret, TelegramChannel};
use funnelgram::channels::telegram_types::Update;
use funnelgram::config::Config;
use funnelgram::funnel::validate::validate_funnel;
use funnelgram::funnel::{FunnelDb, FunnelEngine};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "funnelgram", about = "Conversational funnel engine webhook server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the config.
    #[arg(long)]
    listen: Option<String>,
}

struct AppState {
    db: Arc<FunnelDb>,
    engine: FunnelEngine,
    channels: Mutex<HashMap<String, Arc<TelegramChannel>>>,
}

impl AppState {
    /// One HTTP client per bot token, created on first use.
    fn channel_for(&self, bot_id: &str, token: &str) -> Arc<TelegramChannel> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(TelegramChannel::new(token.to_string())))
            .clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let db = Arc::new(FunnelDb::open(&config.database_path)?);
    validate_active_funnels(&db);

    let engine = FunnelEngine::new(db.clone()).with_pacing(config.pacing.into());
    let state = Arc::new(AppState {
        db,
        engine,
        channels: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/webhook/:bot_id", post(handle_webhook))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::limit::RequestBodyLimitLayer::new(1 << 20))
                .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "funnelgram webhook server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Log structural findings for every active funnel. Authoring problems
/// are surfaced here; the server still starts.
fn validate_active_funnels(db: &FunnelDb) {
    let bots = match db.list_bots() {
        Ok(bots) => bots,
        Err(e) => {
            tracing::warn!(error = %e, "could not list bots for validation");
            return;
        }
    };
    for bot in bots {
        let funnels = match db.active_funnels(&bot.id) {
            Ok(funnels) => funnels,
            Err(e) => {
                tracing::warn!(bot_id = %bot.id, error = %e, "could not list funnels");
                continue;
            }
        };
        for funnel in funnels {
            match db.steps_for_funnel(&funnel.id) {
                Ok(steps) => {
                    if let Err(errors) = validate_funnel(&funnel, &steps) {
                        for error in errors {
                            tracing::warn!(bot_id = %bot.id, "{error}");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(funnel_id = %funnel.id, error = %e, "could not load steps");
                }
            }
        }
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let bot = match state.db.get_bot(&bot_id) {
        Ok(Some(bot)) if bot.is_active => bot,
        Ok(_) => {
            tracing::warn!(bot_id, "webhook for unknown or inactive bot");
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"ok": false, "error": "Bot not found"})),
            );
        }
        Err(e) => {
            tracing::error!(bot_id, error = %e, "bot lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false})),
            );
        }
    };

    let provided = headers
        .get("X-Telegram-Bot-Api-Secret-Token")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_secret(bot.webhook_secret.as_deref(), provided) {
        tracing::warn!(bot_id, "webhook secret verification failed");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"ok": false, "error": "Unauthorized"})),
        );
    }

    tracing::info!(
        bot_id,
        update_id = payload.get("update_id").and_then(|v| v.as_i64()),
        has_message = payload.get("message").is_some(),
        has_callback = payload.get("callback_query").is_some(),
        "webhook received"
    );

    let update: Update = match serde_json::from_value(payload) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(bot_id, error = %e, "unparseable update");
            return (StatusCode::OK, Json(json!({"ok": false})));
        }
    };

    let api = state.channel_for(&bot.id, &bot.token);
    if let Err(e) = state.engine.handle_update(api.as_ref(), &bot, &update).await {
        tracing::error!(bot_id = %bot.id, error = %e, "webhook processing failed");
        // Always 200 so the platform does not redeliver.
        return (StatusCode::OK, Json(json!({"ok": false})));
    }

    (StatusCode::OK, Json(json!({"ok": true})))
}
