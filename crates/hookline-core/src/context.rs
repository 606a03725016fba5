use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callbacks::HookRegistration;
use crate::stream::{StreamReader, StreamWriter, pipe};

/// Per-invocation execution context: cancellation, nesting depth, hooks, and a shared
/// annotation map hooks can write to.
///
/// Clones share the annotation map and the cancellation token.
#[derive(Clone, Debug)]
pub struct CallContext {
    invocation_id: Uuid,
    cancel: CancellationToken,
    depth: u32,
    hooks: Arc<[HookRegistration]>,
    annotations: Arc<DashMap<String, serde_json::Value>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            depth: 0,
            hooks: Arc::from(Vec::new()),
            annotations: Arc::new(DashMap::new()),
        }
    }

    /// Use `token` for cancellation; cancelling it stops the invocation and ends its streams.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attach a hook for invocations made with this context only.
    pub fn with_hook(mut self, registration: HookRegistration) -> Self {
        let mut hooks = self.hooks.to_vec();
        hooks.push(registration);
        self.hooks = Arc::from(hooks);
        self
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Nesting depth of the step this context was handed to (0 for a top-level pipeline).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Create a stream tied to this context's cancellation.
    pub fn pipe<T: Send + 'static>(&self) -> (StreamWriter<T>, StreamReader<T>) {
        pipe(self.cancel.clone())
    }

    pub fn annotate(&self, key: impl Into<String>, value: serde_json::Value) {
        self.annotations.insert(key.into(), value);
    }

    pub fn annotation(&self, key: &str) -> Option<serde_json::Value> {
        self.annotations.get(key).map(|v| v.value().clone())
    }

    pub(crate) fn hooks(&self) -> &[HookRegistration] {
        &self.hooks
    }

    /// Scope for one pipeline run: child cancellation token, `extra` hooks appended.
    pub(crate) fn enter(&self, extra: &[HookRegistration]) -> Self {
        let mut hooks = self.hooks.to_vec();
        hooks.extend(extra.iter().cloned());
        Self {
            invocation_id: self.invocation_id,
            cancel: self.cancel.child_token(),
            depth: self.depth,
            hooks: Arc::from(hooks),
            annotations: Arc::clone(&self.annotations),
        }
    }

    /// Context handed to the nodes of the current run.
    pub(crate) fn descend(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
