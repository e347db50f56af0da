use super::types::{InputKind, InputSpec};
use crate::channels::telegram_types::IncomingMessage;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Permissive international form: optional +, digits with separators.
    RE.get_or_init(|| Regex::new(r"^\+?[0-9\s\-()]{7,20}$").expect("valid regex"))
}

/// Pull a typed value out of an inbound message. `None` means the update
/// carries nothing usable for this input kind (treated as invalid input).
pub fn extract(message: &IncomingMessage, kind: InputKind) -> Option<Value> {
    match kind {
        InputKind::Text | InputKind::Email | InputKind::Number => {
            message.text.clone().map(Value::String)
        }
        InputKind::Phone => {
            // Phone arrives either as typed digits or as a shared contact.
            if let Some(ref contact) = message.contact {
                return Some(Value::String(contact.phone_number.clone()));
            }
            message.text.clone().map(Value::String)
        }
        InputKind::Contact => message.contact.as_ref().map(|c| {
            let mut obj = Map::new();
            obj.insert("phone".into(), Value::String(c.phone_number.clone()));
            if let Some(ref f) = c.first_name {
                obj.insert("first_name".into(), Value::String(f.clone()));
            }
            if let Some(ref l) = c.last_name {
                obj.insert("last_name".into(), Value::String(l.clone()));
            }
            Value::Object(obj)
        }),
        InputKind::Location => message.location.as_ref().map(|l| {
            let mut obj = Map::new();
            obj.insert("latitude".into(), Value::from(l.latitude));
            obj.insert("longitude".into(), Value::from(l.longitude));
            Value::Object(obj)
        }),
        InputKind::Photo => message
            .photo
            .as_ref()
            // Sizes come smallest-first; take the largest.
            .and_then(|sizes| sizes.last())
            .map(|p| Value::String(p.file_id.clone())),
        InputKind::Document => message
            .document
            .as_ref()
            .map(|d| Value::String(d.file_id.clone())),
    }
}

/// Check an extracted value against the step's type and rules.
pub fn validate(value: &Value, spec: &InputSpec) -> bool {
    match spec.kind {
        InputKind::Email => value
            .as_str()
            .is_some_and(|s| email_re().is_match(s.trim())),
        InputKind::Phone => value
            .as_str()
            .is_some_and(|s| phone_re().is_match(s.trim())),
        InputKind::Number => {
            let Some(n) = value.as_str().and_then(|s| s.trim().parse::<f64>().ok()) else {
                return false;
            };
            if spec.rules.min.is_some_and(|min| n < min) {
                return false;
            }
            if spec.rules.max.is_some_and(|max| n > max) {
                return false;
            }
            true
        }
        InputKind::Text => {
            let Some(s) = value.as_str() else {
                return false;
            };
            let len = s.chars().count();
            if spec.rules.min_length.is_some_and(|min| len < min) {
                return false;
            }
            if spec.rules.max_length.is_some_and(|max| len > max) {
                return false;
            }
            if let Some(ref pattern) = spec.rules.pattern {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            return false;
                        }
                    }
                    Err(e) => {
                        // An unparseable authored pattern rejects the input.
                        tracing::warn!(pattern = %pattern, error = %e, "invalid validation pattern");
                        return false;
                    }
                }
            }
            true
        }
        // Structured payloads were shape-checked during extraction.
        InputKind::Contact | InputKind::Location | InputKind::Photo | InputKind::Document => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::telegram_types::{ContactPayload, LocationPayload, PhotoSize};
    use crate::funnel::types::ValidationRules;

    fn text_msg(text: &str) -> IncomingMessage {
        IncomingMessage {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn email_requires_tld() {
        let spec = InputSpec::new(InputKind::Email);
        assert!(!validate(&Value::String("test@example".into()), &spec));
        assert!(validate(&Value::String("test@example.com".into()), &spec));
        assert!(!validate(&Value::String("not an email".into()), &spec));
        assert!(!validate(&Value::String("@example.com".into()), &spec));
    }

    #[test]
    fn phone_pattern_accepts_international_forms() {
        let spec = InputSpec::new(InputKind::Phone);
        for ok in ["+998901234567", "998 90 123-45-67", "(90) 123 45 67"] {
            assert!(validate(&Value::String(ok.into()), &spec), "{ok}");
        }
        for bad in ["12345", "call me", "+9989012345678901234567", "90a1234567"] {
            assert!(!validate(&Value::String(bad.into()), &spec), "{bad}");
        }
    }

    #[test]
    fn number_bounds() {
        let mut spec = InputSpec::new(InputKind::Number);
        spec.rules = ValidationRules {
            min: Some(18.0),
            max: Some(99.0),
            ..Default::default()
        };
        assert!(validate(&Value::String("42".into()), &spec));
        assert!(validate(&Value::String("18".into()), &spec));
        assert!(!validate(&Value::String("17".into()), &spec));
        assert!(!validate(&Value::String("100".into()), &spec));
        assert!(!validate(&Value::String("forty".into()), &spec));
    }

    #[test]
    fn text_length_and_pattern() {
        let mut spec = InputSpec::new(InputKind::Text);
        spec.rules = ValidationRules {
            min_length: Some(2),
            max_length: Some(5),
            pattern: Some("^[a-z]+$".into()),
            ..Default::default()
        };
        assert!(validate(&Value::String("abc".into()), &spec));
        assert!(!validate(&Value::String("a".into()), &spec));
        assert!(!validate(&Value::String("abcdef".into()), &spec));
        assert!(!validate(&Value::String("ABC".into()), &spec));
    }

    #[test]
    fn invalid_authored_pattern_rejects() {
        let mut spec = InputSpec::new(InputKind::Text);
        spec.rules.pattern = Some("([unclosed".into());
        assert!(!validate(&Value::String("anything".into()), &spec));
    }

    #[test]
    fn phone_extraction_prefers_contact_payload() {
        let mut msg = text_msg("whatever");
        msg.contact = Some(ContactPayload {
            phone_number: "+998901112233".into(),
            first_name: Some("Ada".into()),
            last_name: None,
        });
        let value = extract(&msg, InputKind::Phone).unwrap();
        assert_eq!(value, Value::String("+998901112233".into()));
    }

    #[test]
    fn contact_extraction_builds_object() {
        let mut msg = IncomingMessage::default();
        msg.contact = Some(ContactPayload {
            phone_number: "+998901112233".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
        });
        let value = extract(&msg, InputKind::Contact).unwrap();
        assert_eq!(value["phone"], "+998901112233");
        assert_eq!(value["first_name"], "Ada");
        // A text message carries no contact.
        assert!(extract(&text_msg("hi"), InputKind::Contact).is_none());
    }

    #[test]
    fn location_extraction() {
        let mut msg = IncomingMessage::default();
        msg.location = Some(LocationPayload {
            latitude: 41.31,
            longitude: 69.24,
        });
        let value = extract(&msg, InputKind::Location).unwrap();
        assert_eq!(value["latitude"], 41.31);
        assert_eq!(value["longitude"], 69.24);
    }

    #[test]
    fn photo_extraction_takes_largest_size() {
        let mut msg = IncomingMessage::default();
        msg.photo = Some(vec![
            PhotoSize {
                file_id: "small".into(),
                width: 90,
                height: 90,
            },
            PhotoSize {
                file_id: "large".into(),
                width: 800,
                height: 800,
            },
        ]);
        let value = extract(&msg, InputKind::Photo).unwrap();
        assert_eq!(value, Value::String("large".into()));
    }

    #[test]
    fn missing_payload_extracts_none() {
        let msg = IncomingMessage::default();
        assert!(extract(&msg, InputKind::Text).is_none());
        assert!(extract(&msg, InputKind::Photo).is_none());
        assert!(extract(&msg, InputKind::Document).is_none());
        assert!(extract(&msg, InputKind::Location).is_none());
    }
}
