//! Utility pieces compiled into the engine binary.
//!
//! `core@0.1.0` carries small building blocks (echo, arithmetic, sleeping,
//! pausing, stopping, tagging, failure injection) plus an `items` polling trigger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{
    PieceContext, PieceDefinition, PieceError, PieceRegistry, Trigger, TriggerContext, action_fn,
};
use crate::flow::PauseMetadata;

pub const CORE_PIECE: &str = "core";
pub const CORE_VERSION: &str = "0.1.0";

pub fn registry() -> Arc<PieceRegistry> {
    PieceRegistry::builder().register(core_piece()).build()
}

pub fn core_piece() -> PieceDefinition {
    PieceDefinition::new(CORE_PIECE, CORE_VERSION)
        .with_display_name("Core utilities")
        .with_action("echo", action_fn(|ctx: PieceContext| async move { Ok(ctx.input) }))
        .with_action("double", action_fn(double))
        .with_action("sleep", action_fn(sleep))
        .with_action("wait_for_webhook", action_fn(wait_for_webhook))
        .with_action("delay", action_fn(delay))
        .with_action("respond", action_fn(respond))
        .with_action("tag", action_fn(tag))
        .with_action("fail", action_fn(fail))
        .with_action("allocate", action_fn(allocate))
        .with_trigger("items", Arc::new(ItemsTrigger))
}

fn number_field(input: &Value, field: &str) -> Result<Value, PieceError> {
    input
        .get(field)
        .filter(|value| value.is_number())
        .cloned()
        .ok_or_else(|| PieceError::invalid_input(format!("`{field}` must be a number")))
}

fn u64_field(input: &Value, field: &str) -> Result<u64, PieceError> {
    input
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| PieceError::invalid_input(format!("`{field}` must be a non-negative integer")))
}

async fn double(ctx: PieceContext) -> Result<Value, PieceError> {
    let value = number_field(&ctx.input, "value")?;
    if let Some(int) = value.as_i64() {
        return int
            .checked_mul(2)
            .map(Value::from)
            .ok_or_else(|| PieceError::failed("integer overflow"));
    }
    let float = value.as_f64().unwrap_or_default() * 2.0;
    Ok(json!(float))
}

async fn sleep(ctx: PieceContext) -> Result<Value, PieceError> {
    let millis = u64_field(&ctx.input, "millis")?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(json!({ "slept_ms": millis }))
}

/// Always pauses; on resume the engine records the resume payload as this
/// step's output without calling the piece again.
async fn wait_for_webhook(ctx: PieceContext) -> Result<Value, PieceError> {
    let response = ctx.input.get("response").cloned();
    ctx.run.pause(PauseMetadata::Webhook {
        request_id: Uuid::new_v4().to_string(),
        response,
    });
    Ok(Value::Null)
}

async fn delay(ctx: PieceContext) -> Result<Value, PieceError> {
    let seconds = u64_field(&ctx.input, "seconds")?;
    let resume_at = i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| PieceError::invalid_input(format!("delay of {seconds}s is out of range")))?;
    ctx.run.pause(PauseMetadata::Delay { resume_at });
    Ok(json!({ "resume_at": resume_at }))
}

async fn respond(ctx: PieceContext) -> Result<Value, PieceError> {
    let body = ctx.input.get("body").cloned().unwrap_or(Value::Null);
    ctx.run.stop(body.clone());
    Ok(body)
}

async fn tag(ctx: PieceContext) -> Result<Value, PieceError> {
    let tags = ctx
        .input
        .get("tags")
        .and_then(Value::as_array)
        .ok_or_else(|| PieceError::invalid_input("`tags` must be a list"))?;
    for tag in tags.iter().filter_map(Value::as_str) {
        ctx.tags.add(tag);
    }
    Ok(json!({ "tagged": tags.len() }))
}

async fn fail(ctx: PieceContext) -> Result<Value, PieceError> {
    let message = ctx
        .input
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("step failed on request");
    Err(PieceError::failed(message))
}

/// Touches every page so the allocation is charged against the memory limit.
async fn allocate(ctx: PieceContext) -> Result<Value, PieceError> {
    let megabytes = u64_field(&ctx.input, "megabytes")?;
    let bytes = usize::try_from(megabytes.saturating_mul(1024 * 1024))
        .map_err(|_| PieceError::invalid_input("allocation size overflows usize"))?;
    let buffer = vec![1u8; bytes];
    let checksum = buffer.iter().step_by(4096).map(|b| *b as u64).sum::<u64>();
    Ok(json!({ "allocated_mb": megabytes, "pages": checksum }))
}

/// Emits the list found under `events` in its input, dropping events whose
/// `created_at` is not newer than the last poll.
struct ItemsTrigger;

#[async_trait]
impl Trigger for ItemsTrigger {
    async fn poll(&self, ctx: TriggerContext) -> Result<Vec<Value>, PieceError> {
        let events = ctx
            .input
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let Some(since) = ctx.last_polled_at else {
            return Ok(events);
        };
        Ok(events
            .into_iter()
            .filter(|event| {
                event
                    .get("created_at")
                    .and_then(Value::as_str)
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .is_none_or(|created| created.with_timezone(&Utc) > since)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ExecutionType, PieceRef};
    use crate::pieces::{ControlSignal, RunHooks, TagHooks};
    use indexmap::IndexMap;

    fn ctx(input: Value) -> PieceContext {
        PieceContext {
            run_id: Uuid::nil(),
            step_name: "step".to_string(),
            input,
            execution_type: ExecutionType::Begin,
            trigger_payload: Value::Null,
            resume_payload: None,
            steps: IndexMap::new(),
            run: RunHooks::default(),
            tags: TagHooks::default(),
        }
    }

    fn core(action: &str) -> Arc<dyn crate::pieces::Action> {
        registry()
            .action(&PieceRef::new(CORE_PIECE, CORE_VERSION), action)
            .unwrap()
    }

    #[tokio::test]
    async fn double_keeps_integers_integral() {
        assert_eq!(core("double").run(ctx(json!({"value": 3}))).await.unwrap(), json!(6));
        assert_eq!(core("double").run(ctx(json!({"value": 1.5}))).await.unwrap(), json!(3.0));
        assert!(matches!(
            core("double").run(ctx(json!({"value": "3"}))).await,
            Err(PieceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn wait_for_webhook_requests_a_pause() {
        let context = ctx(json!({"response": {"ok": true}}));
        let hooks = context.run.clone();
        core("wait_for_webhook").run(context).await.unwrap();
        match hooks.take_signal() {
            Some(ControlSignal::Pause(PauseMetadata::Webhook { response, request_id })) => {
                assert_eq!(response, Some(json!({"ok": true})));
                assert!(!request_id.is_empty());
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn delay_schedules_resume_in_the_future() {
        let context = ctx(json!({"seconds": 60}));
        let hooks = context.run.clone();
        core("delay").run(context).await.unwrap();
        match hooks.take_signal() {
            Some(ControlSignal::Pause(PauseMetadata::Delay { resume_at })) => {
                assert!(resume_at > Utc::now() + TimeDelta::seconds(30));
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn delay_out_of_range_is_invalid_input() {
        for seconds in [10_000_000_000_000u64, u64::MAX] {
            let context = ctx(json!({ "seconds": seconds }));
            let hooks = context.run.clone();
            let result = core("delay").run(context).await;
            assert!(matches!(result, Err(PieceError::InvalidInput(_))), "{seconds}: {result:?}");
            assert!(hooks.take_signal().is_none());
        }
    }

    #[tokio::test]
    async fn respond_stops_with_body() {
        let context = ctx(json!({"body": {"status": 201}}));
        let hooks = context.run.clone();
        core("respond").run(context).await.unwrap();
        assert_eq!(
            hooks.take_signal(),
            Some(ControlSignal::Stop(json!({"status": 201})))
        );
    }

    #[tokio::test]
    async fn items_trigger_filters_by_last_poll() {
        let trigger = registry()
            .trigger(&PieceRef::new(CORE_PIECE, CORE_VERSION), "items")
            .unwrap();
        let input = json!({"events": [
            {"id": 1, "created_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "created_at": "2024-03-01T00:00:00Z"},
            {"id": 3}
        ]});
        let since = chrono::DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let events = trigger
            .poll(TriggerContext {
                input,
                last_polled_at: Some(since),
            })
            .await
            .unwrap();
        let ids: Vec<i64> = events.iter().filter_map(|e| e["id"].as_i64()).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
