use super::db::FunnelDb;
use super::types::{BotSettings, CreateLeadConfig, JsonMap, Lead, LeadSource, UserProfile};
use uuid::Uuid;

/// External quota gate consulted before recording a lead. Denial is a
/// normal business condition, not an error: the engine logs and skips.
pub trait LeadQuota: Send + Sync {
    fn can_add_lead(&self, business_id: &str) -> bool;
}

/// Default gate: no limits.
pub struct UnlimitedQuota;

impl LeadQuota for UnlimitedQuota {
    fn can_add_lead(&self, _business_id: &str) -> bool {
        true
    }
}

pub(crate) const BOT_SOURCE_CODE: &str = "telegram_bot";

/// Find the business's bot lead source, or create one. A create race
/// (unique code conflict) retries once with a time-suffixed code; total
/// failure degrades to "no source" rather than aborting the funnel.
pub fn resolve_lead_source(db: &FunnelDb, business_id: &str) -> Option<LeadSource> {
    match db.lead_source_by_code(business_id, BOT_SOURCE_CODE) {
        Ok(Some(source)) => return Some(source),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(business_id, error = %e, "lead source lookup failed");
            return None;
        }
    }

    if let Ok(Some(source)) = db.lead_source_by_name_like(business_id, "%telegram%") {
        return Some(source);
    }

    let prefix: String = business_id.chars().take(8).collect();
    let source = LeadSource {
        id: Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        code: format!("{BOT_SOURCE_CODE}_{prefix}"),
        name: "Telegram Bot".into(),
        category: "digital".into(),
        is_active: true,
    };

    match db.insert_lead_source(&source) {
        Ok(()) => Some(source),
        Err(e) => {
            tracing::warn!(business_id, error = %e, "lead source creation failed, retrying");
            let retry = LeadSource {
                id: Uuid::new_v4().to_string(),
                code: format!("{BOT_SOURCE_CODE}_{}", chrono::Utc::now().timestamp()),
                ..source
            };
            match db.insert_lead_source(&retry) {
                Ok(()) => Some(retry),
                Err(e2) => {
                    tracing::error!(business_id, error = %e2, "lead source creation failed completely");
                    None
                }
            }
        }
    }
}

/// Assemble a lead from collected data with profile fallbacks, plus the
/// JSON audit blob stored in `notes`.
pub fn build_lead(
    config: &CreateLeadConfig,
    bot: &BotSettings,
    user: &UserProfile,
    source_id: Option<String>,
    funnel_id: Option<&str>,
    funnel_name: Option<&str>,
    collected: &JsonMap,
) -> Lead {
    let pick = |field: &Option<String>, default: &str| -> Option<String> {
        let key = field.as_deref().unwrap_or(default);
        collected
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let name = pick(&config.name_field, "name").or_else(|| {
        let full = user.full_name();
        (!full.is_empty()).then_some(full)
    });
    let phone = pick(&config.phone_field, "phone").or_else(|| user.phone.clone());
    let email = pick(&config.email_field, "email");

    let notes = serde_json::json!({
        "telegram_user_id": user.telegram_id,
        "funnel": funnel_name,
        "collected_data": collected,
    })
    .to_string();

    let mut data = JsonMap::new();
    data.insert("source".into(), "telegram_funnel".into());
    data.insert("bot_id".into(), bot.id.clone().into());
    if let Some(f) = funnel_id {
        data.insert("funnel_id".into(), f.into());
    }
    data.insert("telegram_user_id".into(), user.telegram_id.into());

    Lead {
        id: Uuid::new_v4().to_string(),
        business_id: bot.business_id.clone(),
        source_id,
        name,
        phone,
        email,
        status: "new".into(),
        notes,
        data,
    }
}
