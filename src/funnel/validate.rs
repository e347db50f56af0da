use super::types::{Funnel, Step, StepConfig};
use std::collections::{HashMap, HashSet, VecDeque};

/// A structural problem that makes a funnel graph unexecutable.
#[derive(Debug, Clone, thiserror::Error)]
#[error("funnel '{funnel_name}': {message}")]
pub struct FunnelValidationError {
    pub funnel_name: String,
    pub message: String,
}

/// Validate a funnel's step arena. Hard errors are returned; softer
/// findings (unreachable steps, odd A/B weights, cycles) are logged.
/// Cycles are tolerated at runtime, so they only get an info line here.
pub fn validate_funnel(funnel: &Funnel, steps: &[Step]) -> Result<(), Vec<FunnelValidationError>> {
    let mut errors = Vec::new();
    let name = &funnel.name;

    let mut seen_ids = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(FunnelValidationError {
                funnel_name: name.clone(),
                message: format!("duplicate step id '{}'", step.id),
            });
        }
    }

    let step_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    let entry = funnel.first_step_id.as_deref();
    match entry {
        None => errors.push(FunnelValidationError {
            funnel_name: name.clone(),
            message: "funnel has no entry step".into(),
        }),
        Some(first) if !step_ids.contains(first) => errors.push(FunnelValidationError {
            funnel_name: name.clone(),
            message: format!("entry step '{first}' does not exist"),
        }),
        _ => {}
    }

    for step in steps {
        for target in step.outgoing_edges() {
            if !step_ids.contains(target) {
                errors.push(FunnelValidationError {
                    funnel_name: name.clone(),
                    message: format!(
                        "step '{}': branch target '{target}' does not exist",
                        step.id
                    ),
                });
            }
        }

        if let StepConfig::AbTest(ref ab) = step.config {
            let total: u32 = ab.variants.iter().map(|v| v.weight).sum();
            if total != 100 {
                tracing::warn!(
                    funnel = %name,
                    step_id = %step.id,
                    total_weight = total,
                    "A/B variant weights do not sum to 100"
                );
            }
        }
    }

    if let Some(first) = entry {
        if step_ids.contains(first) {
            let reachable = find_reachable_steps(steps, first);
            for step in steps {
                if !reachable.contains(step.id.as_str()) {
                    tracing::warn!(
                        funnel = %name,
                        step_id = %step.id,
                        "step is unreachable from the entry step"
                    );
                }
            }

            if has_cycles(steps, first) {
                tracing::info!(funnel = %name, "step graph contains cycles");
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// BFS from the entry step across every branch kind.
fn find_reachable_steps<'a>(steps: &'a [Step], start: &'a str) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current) {
            continue;
        }
        if let Some(step) = by_id.get(current) {
            for target in step.outgoing_edges() {
                queue.push_back(target);
            }
        }
    }

    reachable
}

/// DFS cycle check from the entry step.
fn has_cycles(steps: &[Step], start: &str) -> bool {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    dfs_cycle(&by_id, start, &mut visited, &mut stack)
}

fn dfs_cycle<'a>(
    map: &HashMap<&str, &'a Step>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> bool {
    if stack.contains(node) {
        return true;
    }
    if visited.contains(node) {
        return false;
    }
    visited.insert(node);
    stack.insert(node);

    if let Some(step) = map.get(node) {
        for target in step.outgoing_edges() {
            if dfs_cycle(map, target, visited, stack) {
                return true;
            }
        }
    }

    stack.remove(node);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::types::*;

    fn content_step(id: &str, next: Option<&str>) -> Step {
        Step {
            id: id.into(),
            funnel_id: "f1".into(),
            name: id.into(),
            config: StepConfig::Content(ContentConfig::text("Hi")),
            input: None,
            next_step_id: next.map(str::to_string),
            action: None,
        }
    }

    fn funnel(first: Option<&str>) -> Funnel {
        Funnel {
            id: "f1".into(),
            bot_id: "bot1".into(),
            name: "welcome".into(),
            is_active: true,
            first_step_id: first.map(str::to_string),
            completion_message: None,
        }
    }

    #[test]
    fn valid_chain_passes() {
        let steps = vec![content_step("s1", Some("s2")), content_step("s2", None)];
        assert!(validate_funnel(&funnel(Some("s1")), &steps).is_ok());
    }

    #[test]
    fn missing_entry_step_errors() {
        let steps = vec![content_step("s1", None)];
        let errs = validate_funnel(&funnel(Some("nope")), &steps).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("entry step")));
    }

    #[test]
    fn no_entry_step_errors() {
        let steps = vec![content_step("s1", None)];
        let errs = validate_funnel(&funnel(None), &steps).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("no entry step")));
    }

    #[test]
    fn duplicate_step_ids_error() {
        let steps = vec![content_step("s1", None), content_step("s1", None)];
        let errs = validate_funnel(&funnel(Some("s1")), &steps).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("duplicate step id")));
    }

    #[test]
    fn dangling_branch_target_errors() {
        let mut quiz = content_step("s1", None);
        quiz.config = StepConfig::Quiz(QuizConfig {
            question: "Q?".into(),
            options: vec![QuizOption {
                text: "A".into(),
                next_step_id: Some("ghost".into()),
            }],
            save_answer_to: None,
        });
        let errs = validate_funnel(&funnel(Some("s1")), &[quiz]).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("'ghost'")));
    }

    #[test]
    fn reachability_finds_orphans() {
        let steps = vec![
            content_step("s1", Some("s2")),
            content_step("s2", None),
            content_step("orphan", None),
        ];
        let reachable = find_reachable_steps(&steps, "s1");
        assert!(reachable.contains("s1"));
        assert!(reachable.contains("s2"));
        assert!(!reachable.contains("orphan"));
    }

    #[test]
    fn cycle_detection_tolerant() {
        let steps = vec![content_step("a", Some("b")), content_step("b", Some("a"))];
        assert!(has_cycles(&steps, "a"));
        // Cycles are not a hard error.
        assert!(validate_funnel(&funnel(Some("a")), &steps).is_ok());
    }

    #[test]
    fn condition_branches_are_traversed() {
        let mut cond = content_step("c", None);
        cond.config = StepConfig::Condition(ConditionConfig {
            clause: ConditionClause {
                field: "phone".into(),
                operator: ConditionOp::IsSet,
                value: serde_json::Value::Null,
            },
            true_step_id: Some("yes".into()),
            false_step_id: Some("no".into()),
        });
        let steps = vec![cond, content_step("yes", None), content_step("no", None)];
        let reachable = find_reachable_steps(&steps, "c");
        assert_eq!(reachable.len(), 3);
    }
}
