//! `{{ step.field.0 }}` reference resolution against the visible execution state.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::path::StepExecutionPath;
use super::state::{ExecutionState, StepOutput};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

pub struct InputResolver<'a> {
    outputs: IndexMap<&'a str, &'a StepOutput>,
}

impl<'a> InputResolver<'a> {
    pub fn new(state: &'a ExecutionState, path: &StepExecutionPath) -> Self {
        Self {
            outputs: state.visible_outputs(path),
        }
    }

    pub fn resolve(&self, input: &Value) -> Value {
        match input {
            Value::String(text) => self.resolve_string(text),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.resolve(item)).collect()),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), self.resolve(value)))
                    .collect::<Map<String, Value>>(),
            ),
            other => other.clone(),
        }
    }

    /// Outputs of every visible step, keyed by step name.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.outputs
            .iter()
            .map(|(name, output)| {
                (
                    name.to_string(),
                    output.output.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    fn resolve_string(&self, text: &str) -> Value {
        if let Some(expr) = whole_reference(text) {
            return self.lookup(expr).unwrap_or(Value::Null);
        }
        if !text.contains(OPEN) {
            return Value::String(text.to_string());
        }

        let mut rendered = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(OPEN) {
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                break;
            };
            rendered.push_str(&rest[..start]);
            match self.lookup(after_open[..end].trim()) {
                Some(Value::String(value)) => rendered.push_str(&value),
                Some(Value::Null) | None => {}
                Some(value) => rendered.push_str(&value.to_string()),
            }
            rest = &after_open[end + CLOSE.len()..];
        }
        rendered.push_str(rest);
        Value::String(rendered)
    }

    fn lookup(&self, expr: &str) -> Option<Value> {
        let normalized = expr.replace('[', ".").replace(']', "");
        let mut segments = normalized
            .split('.')
            .map(|segment| segment.trim().trim_matches(|c| c == '"' || c == '\''))
            .filter(|segment| !segment.is_empty());

        let step = segments.next()?;
        let mut current = self.outputs.get(step)?.output.as_ref()?;
        for segment in segments {
            current = match current {
                Value::Object(fields) => fields.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// The inner expression when `text` is exactly one `{{ ... }}` reference.
fn whole_reference(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::StepOutputStatus;
    use crate::flow::StepType;
    use serde_json::json;

    fn state() -> ExecutionState {
        let mut state = ExecutionState::new();
        let root = StepExecutionPath::root();
        state
            .upsert_step(
                &root,
                "trigger",
                StepOutput::new(StepType::Trigger, StepOutputStatus::Succeeded, Value::Null)
                    .with_output(json!({"items": [1, 2, 3], "user": {"name": "Ada"}})),
            )
            .unwrap();
        let mut owner = StepOutput::new(StepType::Loop, StepOutputStatus::Running, Value::Null)
            .with_output(json!({"item": 2, "index": 1}));
        owner.iteration_mut(1);
        state.upsert_step(&root, "loop", owner).unwrap();
        state
    }

    #[test]
    fn whole_reference_keeps_json_type() {
        let state = state();
        let resolver = InputResolver::new(&state, &StepExecutionPath::root());
        assert_eq!(resolver.resolve(&json!("{{trigger.items}}")), json!([1, 2, 3]));
        assert_eq!(resolver.resolve(&json!("{{ trigger.items.1 }}")), json!(2));
        assert_eq!(resolver.resolve(&json!("{{trigger.items[2]}}")), json!(3));
        assert_eq!(resolver.resolve(&json!("{{loop.item}}")), json!(2));
    }

    #[test]
    fn embedded_references_are_interpolated() {
        let state = state();
        let resolver = InputResolver::new(&state, &StepExecutionPath::root());
        assert_eq!(
            resolver.resolve(&json!("hi {{trigger.user.name}}, #{{loop.index}}{{missing.x}}")),
            json!("hi Ada, #1")
        );
    }

    #[test]
    fn nested_structures_resolve_recursively() {
        let state = state();
        let resolver = InputResolver::new(&state, &StepExecutionPath::root());
        let input = json!({"values": ["{{trigger.items.0}}", 7], "who": {"n": "{{trigger.user.name}}"}});
        assert_eq!(
            resolver.resolve(&input),
            json!({"values": [1, 7], "who": {"n": "Ada"}})
        );
    }

    #[test]
    fn unknown_references_resolve_to_null() {
        let state = state();
        let resolver = InputResolver::new(&state, &StepExecutionPath::root());
        assert_eq!(resolver.resolve(&json!("{{nope}}")), Value::Null);
        assert_eq!(resolver.resolve(&json!("{{trigger.items.9}}")), Value::Null);
        assert_eq!(resolver.resolve(&json!("{{ unterminated")), json!("{{ unterminated"));
    }

    #[test]
    fn iteration_outputs_are_visible_inside_the_loop() {
        let mut state = state();
        let inner = StepExecutionPath::root().loop_iteration("loop", 1);
        state
            .upsert_step(
                &inner,
                "double",
                StepOutput::new(StepType::Action, StepOutputStatus::Succeeded, Value::Null)
                    .with_output(json!(4)),
            )
            .unwrap();
        assert_eq!(
            InputResolver::new(&state, &inner).resolve(&json!("{{double}}")),
            json!(4)
        );
        assert_eq!(
            InputResolver::new(&state, &StepExecutionPath::root()).resolve(&json!("{{double}}")),
            Value::Null
        );
    }
}
