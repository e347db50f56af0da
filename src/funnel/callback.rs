/// A decoded inline-button payload. The wire format is colon-delimited;
/// this enum is the single place it is encoded and decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    GoToStep { step_id: String },
    StartFunnel { funnel_id: String },
    Input { field: Option<String>, value: String },
    Handoff { reason: Option<String> },
    Restart,
    QuizAnswer { step_id: String, option_index: usize },
    RecheckSubscribe { step_id: String },
}

impl CallbackAction {
    pub fn encode(&self) -> String {
        match self {
            CallbackAction::GoToStep { step_id } => format!("step:{step_id}"),
            CallbackAction::StartFunnel { funnel_id } => format!("funnel:{funnel_id}"),
            CallbackAction::Input { field, value } => {
                format!("input:{}:{value}", field.as_deref().unwrap_or(""))
            }
            CallbackAction::Handoff { reason } => match reason {
                Some(r) => format!("handoff:{r}"),
                None => "handoff".into(),
            },
            CallbackAction::Restart => "restart".into(),
            CallbackAction::QuizAnswer {
                step_id,
                option_index,
            } => format!("quiz_answer:{step_id}:{option_index}"),
            CallbackAction::RecheckSubscribe { step_id } => {
                format!("recheck_subscribe:{step_id}")
            }
        }
    }

    /// Decode callback data. `None` means the payload is not one of the
    /// engine's actions; the router then falls through to callback-type
    /// triggers.
    pub fn decode(data: &str) -> Option<Self> {
        let mut parts = data.splitn(2, ':');
        let action = parts.next()?;
        let rest = parts.next();

        match action {
            "step" => {
                let step_id = non_empty(rest?)?;
                Some(CallbackAction::GoToStep { step_id })
            }
            "funnel" => {
                let funnel_id = non_empty(rest?)?;
                Some(CallbackAction::StartFunnel { funnel_id })
            }
            "input" => {
                let rest = rest?;
                let (field, value) = rest.split_once(':')?;
                Some(CallbackAction::Input {
                    field: if field.is_empty() {
                        None
                    } else {
                        Some(field.to_string())
                    },
                    value: value.to_string(),
                })
            }
            "handoff" => Some(CallbackAction::Handoff {
                reason: rest.filter(|r| !r.is_empty()).map(str::to_string),
            }),
            "restart" => Some(CallbackAction::Restart),
            "quiz_answer" => {
                let rest = rest?;
                let (step_id, index) = rest.split_once(':')?;
                let step_id = non_empty(step_id)?;
                let option_index = index.parse().ok()?;
                Some(CallbackAction::QuizAnswer {
                    step_id,
                    option_index,
                })
            }
            "recheck_subscribe" => {
                let step_id = non_empty(rest?)?;
                Some(CallbackAction::RecheckSubscribe { step_id })
            }
            _ => None,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let actions = [
            CallbackAction::GoToStep {
                step_id: "s42".into(),
            },
            CallbackAction::StartFunnel {
                funnel_id: "f1".into(),
            },
            CallbackAction::Input {
                field: Some("plan".into()),
                value: "pro".into(),
            },
            CallbackAction::Input {
                field: None,
                value: "yes".into(),
            },
            CallbackAction::Handoff {
                reason: Some("pricing".into()),
            },
            CallbackAction::Handoff { reason: None },
            CallbackAction::Restart,
            CallbackAction::QuizAnswer {
                step_id: "s7".into(),
                option_index: 2,
            },
            CallbackAction::RecheckSubscribe {
                step_id: "s9".into(),
            },
        ];
        for action in actions {
            let encoded = action.encode();
            assert_eq!(CallbackAction::decode(&encoded), Some(action), "{encoded}");
        }
    }

    #[test]
    fn wire_strings_are_stable() {
        assert_eq!(
            CallbackAction::GoToStep {
                step_id: "s1".into()
            }
            .encode(),
            "step:s1"
        );
        assert_eq!(
            CallbackAction::QuizAnswer {
                step_id: "s1".into(),
                option_index: 1
            }
            .encode(),
            "quiz_answer:s1:1"
        );
        assert_eq!(
            CallbackAction::RecheckSubscribe {
                step_id: "s1".into()
            }
            .encode(),
            "recheck_subscribe:s1"
        );
    }

    #[test]
    fn input_value_may_contain_colons() {
        let decoded = CallbackAction::decode("input:url:https://example.com").unwrap();
        assert_eq!(
            decoded,
            CallbackAction::Input {
                field: Some("url".into()),
                value: "https://example.com".into(),
            }
        );
    }

    #[test]
    fn unknown_and_malformed_payloads_decode_to_none() {
        for data in [
            "promo_2026",
            "finish",
            "step:",
            "funnel:",
            "quiz_answer:s1",
            "quiz_answer:s1:abc",
            "recheck_subscribe:",
            "input:only_field",
            "",
        ] {
            assert_eq!(CallbackAction::decode(data), None, "{data:?}");
        }
    }
}
