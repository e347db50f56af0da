use super::types::{KeywordSpec, MatchMode, Trigger};
use regex::RegexBuilder;

/// Case-insensitive structural match of `text` against `value` per mode.
pub fn mode_matches(mode: MatchMode, value: &str, text: &str) -> bool {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return false;
    }
    let text = text.trim().to_lowercase();
    match mode {
        MatchMode::Exact => text == value,
        MatchMode::Contains => text.contains(&value),
        MatchMode::StartsWith => text.starts_with(&value),
        MatchMode::EndsWith => text.ends_with(&value),
        MatchMode::Regex => match RegexBuilder::new(&value).case_insensitive(true).build() {
            Ok(re) => re.is_match(&text),
            Err(e) => {
                tracing::warn!(pattern = %value, error = %e, "invalid trigger regex");
                false
            }
        },
    }
}

impl Trigger {
    /// Does an inbound message text fire this trigger?
    pub fn matches(&self, text: &str) -> bool {
        mode_matches(self.match_mode, &self.value, text)
    }
}

/// Split an authored keyword list on commas and newlines, lowercased,
/// blanks dropped.
pub fn split_keywords(keywords: &str) -> Vec<String> {
    keywords
        .split(|c| c == ',' || c == '\n')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

impl KeywordSpec {
    /// Does a message text fire this `trigger_keyword` entry marker?
    /// The catch-all matches any non-empty text; otherwise the first
    /// matching keyword from the list wins.
    pub fn matches(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if self.all_messages {
            return true;
        }
        split_keywords(&self.keywords)
            .iter()
            .any(|keyword| mode_matches(self.match_mode, keyword, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::types::TriggerKind;

    fn trigger(value: &str, mode: MatchMode) -> Trigger {
        Trigger {
            id: "t1".into(),
            bot_id: "bot1".into(),
            name: "test".into(),
            kind: TriggerKind::Keyword,
            value: value.into(),
            match_mode: mode,
            funnel_id: Some("f1".into()),
            step_id: None,
            priority: 0,
            is_active: true,
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let t = trigger("Price", MatchMode::Exact);
        assert!(t.matches("price"));
        assert!(t.matches("PRICE"));
        assert!(!t.matches("prices"));
    }

    #[test]
    fn contains_starts_ends_modes() {
        assert!(trigger("disc", MatchMode::Contains).matches("any DISCOUNT today?"));
        assert!(trigger("hello", MatchMode::StartsWith).matches("Hello there"));
        assert!(!trigger("hello", MatchMode::StartsWith).matches("say hello"));
        assert!(trigger("bye", MatchMode::EndsWith).matches("ok BYE"));
        assert!(!trigger("bye", MatchMode::EndsWith).matches("bye now"));
    }

    #[test]
    fn regex_mode() {
        let t = trigger(r"^ord(er)?\s+\d+$", MatchMode::Regex);
        assert!(t.matches("order 42"));
        assert!(t.matches("ORD 7"));
        assert!(!t.matches("order"));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let t = trigger("([unclosed", MatchMode::Regex);
        assert!(!t.matches("([unclosed"));
    }

    #[test]
    fn empty_value_never_matches() {
        let t = trigger("", MatchMode::Contains);
        assert!(!t.matches("anything"));
    }

    #[test]
    fn keyword_list_splits_on_commas_and_newlines() {
        let list = split_keywords("price, Cost\n  discount ,,\n");
        assert_eq!(list, vec!["price", "cost", "discount"]);
    }

    #[test]
    fn keyword_spec_matching() {
        let spec = KeywordSpec {
            all_messages: false,
            keywords: "price,cost".into(),
            match_mode: MatchMode::Contains,
        };
        assert!(spec.matches("what's the PRICE?"));
        assert!(spec.matches("total cost please"));
        assert!(!spec.matches("hello"));
    }

    #[test]
    fn all_messages_catch_all() {
        let spec = KeywordSpec {
            all_messages: true,
            keywords: String::new(),
            match_mode: MatchMode::Contains,
        };
        assert!(spec.matches("literally anything"));
        assert!(!spec.matches("   "));
    }
}
