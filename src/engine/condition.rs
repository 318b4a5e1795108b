//! Branch and router condition evaluation.
//!
//! Condition groups are an OR of AND groups. Values are expected to be resolved
//! already (see [`super::resolver`]); evaluation itself is pure.

use serde_json::Value;

use super::resolver::InputResolver;
use crate::flow::{Condition, ConditionOperator};

/// Resolves both operands of every condition against the current state.
pub fn resolve_groups(groups: &[Vec<Condition>], resolver: &InputResolver<'_>) -> Vec<Vec<Condition>> {
    groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|condition| Condition {
                    first_value: resolver.resolve(&condition.first_value),
                    second_value: resolver.resolve(&condition.second_value),
                    ..condition.clone()
                })
                .collect()
        })
        .collect()
}

/// An empty group list, or a group without conditions, never matches.
pub fn evaluate_groups(groups: &[Vec<Condition>]) -> bool {
    groups
        .iter()
        .any(|group| !group.is_empty() && group.iter().all(evaluate))
}

pub fn evaluate(condition: &Condition) -> bool {
    let first = &condition.first_value;
    let second = &condition.second_value;
    let fold = |value: &Value| {
        let text = as_text(value);
        if condition.case_sensitive {
            text
        } else {
            text.to_lowercase()
        }
    };

    match condition.operator {
        ConditionOperator::TextContains => fold(first).contains(&fold(second)),
        ConditionOperator::TextDoesNotContain => !fold(first).contains(&fold(second)),
        ConditionOperator::TextExactlyMatches => fold(first) == fold(second),
        ConditionOperator::TextDoesNotExactlyMatch => fold(first) != fold(second),
        ConditionOperator::TextStartsWith => fold(first).starts_with(&fold(second)),
        ConditionOperator::TextEndsWith => fold(first).ends_with(&fold(second)),
        ConditionOperator::NumberIsGreaterThan => compare(first, second, |a, b| a > b),
        ConditionOperator::NumberIsLessThan => compare(first, second, |a, b| a < b),
        ConditionOperator::NumberIsEqualTo => compare(first, second, |a, b| a == b),
        ConditionOperator::BooleanIsTrue => as_bool(first) == Some(true),
        ConditionOperator::BooleanIsFalse => as_bool(first) == Some(false),
        ConditionOperator::Exists => exists(first),
        ConditionOperator::DoesNotExist => !exists(first),
        ConditionOperator::ListIsEmpty => first.as_array().is_some_and(Vec::is_empty),
        ConditionOperator::ListIsNotEmpty => first.as_array().is_some_and(|items| !items.is_empty()),
        ConditionOperator::ListContains => {
            let needle = fold(second);
            first
                .as_array()
                .is_some_and(|items| items.iter().any(|item| fold(item) == needle))
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn exists(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

fn compare(first: &Value, second: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(first), as_number(second)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(first: Value, operator: ConditionOperator, second: Value) -> Condition {
        Condition {
            first_value: first,
            operator,
            second_value: second,
            case_sensitive: false,
        }
    }

    #[test]
    fn text_operators_ignore_case_by_default() {
        assert!(evaluate(&condition(
            json!("Hello World"),
            ConditionOperator::TextContains,
            json!("WORLD")
        )));
        let mut strict = condition(
            json!("Hello"),
            ConditionOperator::TextExactlyMatches,
            json!("hello"),
        );
        strict.case_sensitive = true;
        assert!(!evaluate(&strict));
        strict.case_sensitive = false;
        assert!(evaluate(&strict));
        assert!(evaluate(&condition(
            json!("report.pdf"),
            ConditionOperator::TextEndsWith,
            json!(".PDF")
        )));
    }

    #[test]
    fn number_operators_parse_strings() {
        assert!(evaluate(&condition(
            json!("10"),
            ConditionOperator::NumberIsGreaterThan,
            json!(9.5)
        )));
        assert!(!evaluate(&condition(
            json!("ten"),
            ConditionOperator::NumberIsLessThan,
            json!(100)
        )));
        assert!(evaluate(&condition(
            json!(3),
            ConditionOperator::NumberIsEqualTo,
            json!("3.0")
        )));
    }

    #[test]
    fn existence_and_list_operators() {
        assert!(!evaluate(&condition(json!(""), ConditionOperator::Exists, Value::Null)));
        assert!(evaluate(&condition(Value::Null, ConditionOperator::DoesNotExist, Value::Null)));
        assert!(evaluate(&condition(json!([]), ConditionOperator::ListIsEmpty, Value::Null)));
        assert!(!evaluate(&condition(json!("x"), ConditionOperator::ListIsEmpty, Value::Null)));
        assert!(evaluate(&condition(
            json!(["A", "b"]),
            ConditionOperator::ListContains,
            json!("a")
        )));
        assert!(evaluate(&condition(
            json!("TRUE"),
            ConditionOperator::BooleanIsTrue,
            Value::Null
        )));
    }

    #[test]
    fn groups_are_or_of_and() {
        let yes = condition(json!(true), ConditionOperator::BooleanIsTrue, Value::Null);
        let no = condition(json!(false), ConditionOperator::BooleanIsTrue, Value::Null);
        assert!(!evaluate_groups(&[]));
        assert!(!evaluate_groups(&[vec![]]));
        assert!(!evaluate_groups(&[vec![yes.clone(), no.clone()]]));
        assert!(evaluate_groups(&[vec![yes.clone(), no], vec![yes]]));
    }
}
