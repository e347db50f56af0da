use super::types::{BotSettings, JsonMap, UserProfile};
use serde_json::Value;

/// Everything a `{placeholder}` token can resolve against.
pub struct VarScope<'a> {
    pub user: &'a UserProfile,
    pub bot: &'a BotSettings,
    pub collected: &'a JsonMap,
}

/// Substitute `{token}` placeholders in a template. Tokens are resolved
/// individually (collected data first, then profile/bot attributes), so a
/// value containing braces is never re-expanded and unknown tokens stay
/// literal.
pub fn interpolate(template: &str, scope: &VarScope<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(end) if after.as_bytes()[end] == b'}' => {
                let token = &after[..end];
                match resolve(token, scope) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                // Unterminated (or nested) brace: emit as-is and move on.
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve(token: &str, scope: &VarScope<'_>) -> Option<String> {
    if let Some(value) = scope.collected.get(token) {
        if let Some(text) = value_text(value) {
            return Some(text);
        }
    }

    match token {
        "first_name" => Some(scope.user.first_name.clone().unwrap_or_default()),
        "last_name" => Some(scope.user.last_name.clone().unwrap_or_default()),
        "full_name" => Some(scope.user.full_name()),
        "username" => Some(
            scope
                .user
                .username
                .as_ref()
                .map(|u| format!("@{u}"))
                .unwrap_or_default(),
        ),
        "phone" => Some(scope.user.phone.clone().unwrap_or_default()),
        "bot_name" => Some(scope.bot.display_name.clone().unwrap_or_default()),
        _ => None,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::types::{BotSettings, UserProfile};

    fn scope_fixture() -> (UserProfile, BotSettings, JsonMap) {
        let mut user = UserProfile::new("bot1", 42, 42);
        user.first_name = Some("Ada".into());
        user.last_name = Some("Lovelace".into());
        user.username = Some("ada".into());
        user.phone = Some("+998901234567".into());
        let mut bot = BotSettings::new("bot1", "biz1", "token");
        bot.display_name = Some("SalesBot".into());
        let mut collected = JsonMap::new();
        collected.insert("city".into(), Value::String("Tashkent".into()));
        collected.insert("age".into(), Value::from(30));
        (user, bot, collected)
    }

    #[test]
    fn resolves_profile_and_bot_tokens() {
        let (user, bot, collected) = scope_fixture();
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(
            interpolate("Hi {first_name} {last_name} ({username}) from {bot_name}", &scope),
            "Hi Ada Lovelace (@ada) from SalesBot"
        );
    }

    #[test]
    fn collected_data_takes_precedence() {
        let (user, bot, mut collected) = scope_fixture();
        collected.insert("first_name".into(), Value::String("Grace".into()));
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(interpolate("Hi {first_name}", &scope), "Hi Grace");
    }

    #[test]
    fn unknown_tokens_stay_literal() {
        let (user, bot, collected) = scope_fixture();
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(
            interpolate("Hello {nonexistent_token}!", &scope),
            "Hello {nonexistent_token}!"
        );
    }

    #[test]
    fn numeric_collected_values_render() {
        let (user, bot, collected) = scope_fixture();
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(interpolate("{city}, age {age}", &scope), "Tashkent, age 30");
    }

    #[test]
    fn missing_profile_fields_render_empty() {
        let user = UserProfile::new("bot1", 1, 1);
        let bot = BotSettings::new("bot1", "biz1", "token");
        let collected = JsonMap::new();
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(interpolate("Hi {first_name}{username}", &scope), "Hi ");
    }

    #[test]
    fn unterminated_brace_passes_through() {
        let (user, bot, collected) = scope_fixture();
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(interpolate("set {a, go", &scope), "set {a, go");
    }

    #[test]
    fn substituted_values_are_not_reexpanded() {
        let (user, bot, mut collected) = scope_fixture();
        collected.insert("note".into(), Value::String("{first_name}".into()));
        let scope = VarScope {
            user: &user,
            bot: &bot,
            collected: &collected,
        };
        assert_eq!(interpolate("{note}", &scope), "{first_name}");
    }
}
