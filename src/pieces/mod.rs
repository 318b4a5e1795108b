//! Piece contract: actions and triggers invoked by the engine.
//!
//! A piece is a named, versioned bundle of actions (run as flow steps) and
//! triggers (polled for new events). The engine resolves pieces through a
//! [`PieceRegistry`] built once at process start; the registry is immutable
//! afterwards and shared behind an `Arc`.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::{ExecutionType, PauseMetadata, PieceRef};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PieceError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("piece {0} is not registered")]
    PieceNotFound(String),
    #[error("piece {piece} has no {kind} named {name}")]
    MemberNotFound {
        piece: String,
        kind: &'static str,
        name: String,
    },
    #[error("code module {0} is not registered")]
    CodeNotFound(String),
}

impl PieceError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Control directive a piece may raise in addition to its return value.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlSignal {
    Pause(PauseMetadata),
    Stop(Value),
}

/// `run.pause(..)` / `run.stop(..)` hooks handed to a piece. The last call wins.
#[derive(Clone, Default)]
pub struct RunHooks {
    signal: Arc<Mutex<Option<ControlSignal>>>,
}

impl RunHooks {
    pub fn pause(&self, metadata: PauseMetadata) {
        self.set(ControlSignal::Pause(metadata));
    }

    pub fn stop(&self, response: Value) {
        self.set(ControlSignal::Stop(response));
    }

    pub fn take_signal(&self) -> Option<ControlSignal> {
        self.signal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn set(&self, signal: ControlSignal) {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal);
    }
}

#[derive(Clone, Default)]
pub struct TagHooks {
    tags: Arc<Mutex<Vec<String>>>,
}

impl TagHooks {
    pub fn add(&self, tag: impl Into<String>) {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner).push(tag.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.tags.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything a step implementation can see about the run it belongs to.
#[derive(Clone)]
pub struct PieceContext {
    pub run_id: Uuid,
    pub step_name: String,
    pub input: Value,
    pub execution_type: ExecutionType,
    /// Output of the trigger that started the run.
    pub trigger_payload: Value,
    /// Payload supplied to the resume call, when this execution is a resume.
    pub resume_payload: Option<Value>,
    /// Outputs of previously executed steps visible from this step.
    pub steps: IndexMap<String, Value>,
    pub run: RunHooks,
    pub tags: TagHooks,
}

#[derive(Clone, Debug)]
pub struct TriggerContext {
    pub input: Value,
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: PieceContext) -> Result<Value, PieceError>;
}

#[async_trait]
pub trait Trigger: Send + Sync {
    async fn poll(&self, ctx: TriggerContext) -> Result<Vec<Value>, PieceError>;
}

pub type ActionCallable =
    Arc<dyn Fn(PieceContext) -> BoxFuture<'static, Result<Value, PieceError>> + Send + Sync>;

struct CallableAction(ActionCallable);

#[async_trait]
impl Action for CallableAction {
    async fn run(&self, ctx: PieceContext) -> Result<Value, PieceError> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(PieceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PieceError>> + Send + 'static,
{
    let callable: ActionCallable = Arc::new(move |ctx| Box::pin(f(ctx)));
    Arc::new(CallableAction(callable))
}

pub struct PieceDefinition {
    pub name: String,
    pub version: String,
    pub display_name: String,
    actions: BTreeMap<String, Arc<dyn Action>>,
    triggers: BTreeMap<String, Arc<dyn Trigger>>,
}

impl PieceDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version: version.into(),
            actions: BTreeMap::new(),
            triggers: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.actions.insert(name.into(), action);
        self
    }

    pub fn with_trigger(mut self, name: impl Into<String>, trigger: Arc<dyn Trigger>) -> Self {
        self.triggers.insert(name.into(), trigger);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceMetadata {
    pub name: String,
    pub version: String,
    pub display_name: String,
    pub actions: Vec<String>,
    pub triggers: Vec<String>,
}

type PieceKey = (String, String);

#[derive(Default)]
pub struct PieceRegistry {
    pieces: HashMap<PieceKey, PieceDefinition>,
    code: BTreeMap<String, Arc<dyn Action>>,
}

impl PieceRegistry {
    pub fn builder() -> PieceRegistryBuilder {
        PieceRegistryBuilder::default()
    }

    fn piece(&self, piece: &PieceRef) -> Result<&PieceDefinition, PieceError> {
        self.pieces
            .get(&(piece.name.clone(), piece.version.clone()))
            .ok_or_else(|| PieceError::PieceNotFound(piece.to_string()))
    }

    pub fn action(&self, piece: &PieceRef, name: &str) -> Result<Arc<dyn Action>, PieceError> {
        self.piece(piece)?
            .actions
            .get(name)
            .cloned()
            .ok_or_else(|| PieceError::MemberNotFound {
                piece: piece.to_string(),
                kind: "action",
                name: name.to_string(),
            })
    }

    pub fn trigger(&self, piece: &PieceRef, name: &str) -> Result<Arc<dyn Trigger>, PieceError> {
        self.piece(piece)?
            .triggers
            .get(name)
            .cloned()
            .ok_or_else(|| PieceError::MemberNotFound {
                piece: piece.to_string(),
                kind: "trigger",
                name: name.to_string(),
            })
    }

    pub fn code_module(&self, module: &str) -> Result<Arc<dyn Action>, PieceError> {
        self.code
            .get(module)
            .cloned()
            .ok_or_else(|| PieceError::CodeNotFound(module.to_string()))
    }

    /// Metadata for every registered piece, sorted by name then version.
    pub fn metadata(&self) -> Vec<PieceMetadata> {
        let mut metadata: Vec<PieceMetadata> = self
            .pieces
            .values()
            .map(|piece| PieceMetadata {
                name: piece.name.clone(),
                version: piece.version.clone(),
                display_name: piece.display_name.clone(),
                actions: piece.actions.keys().cloned().collect(),
                triggers: piece.triggers.keys().cloned().collect(),
            })
            .collect();
        metadata.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        metadata
    }
}

#[derive(Default)]
pub struct PieceRegistryBuilder {
    registry: PieceRegistry,
}

impl PieceRegistryBuilder {
    /// Registering the same name and version twice replaces the earlier piece.
    pub fn register(mut self, piece: PieceDefinition) -> Self {
        self.registry
            .pieces
            .insert((piece.name.clone(), piece.version.clone()), piece);
        self
    }

    pub fn register_code(mut self, module: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.registry.code.insert(module.into(), action);
        self
    }

    pub fn build(self) -> Arc<PieceRegistry> {
        Arc::new(self.registry)
    }
}
