//! # Callback hooks
//!
//! Hooks observe the lifecycle of every step a pipeline runs. A step is identified by its
//! [`RunInfo`]; the pipeline itself reports as a step of kind [`NodeKind::Pipeline`].
//!
//! ## Timings
//!
//! - `on_start` / `on_end` / `on_error` and `on_start_with_stream_input` are awaited inline on
//!   the pipeline's path. They add latency but never change data.
//! - `on_end_with_stream_output` runs in a background task on a private copy of the output
//!   stream, so the caller's copy is never held back by the hook.
//!
//! Hooks that receive a stream own it and must close it (dropping it closes it). A hook that
//! panics is caught at its boundary and logged; the pipeline's result is unaffected.
//!
//! ## Filtering
//!
//! Each [`HookRegistration`] carries a [`RunFilter`]. Use [`RunFilter::TopLevel`] to observe
//! only the outermost pipeline instead of every intermediate stream.

mod handler;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::errors::ExecutionError;
use crate::payload::{Frame, Payload};
use crate::stream::StreamReader;

pub use handler::CallbackHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    ChatModel,
    Tool,
    Tools,
    Pipeline,
    Custom,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::ChatModel => "chat_model",
            NodeKind::Tool => "tool",
            NodeKind::Tools => "tools",
            NodeKind::Pipeline => "pipeline",
            NodeKind::Custom => "custom",
        })
    }
}

/// Identity of the step that raised an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunInfo {
    pub name: String,
    pub kind: NodeKind,
    /// 0 for the pipeline being invoked, 1 for its nodes, and so on for nested pipelines.
    pub depth: u32,
}

impl RunInfo {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depth: 0,
        }
    }

    pub(crate) fn at_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.depth == 0
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timing {
    Start = 0,
    End = 1,
    Error = 2,
    StartWithStreamInput = 3,
    EndWithStreamOutput = 4,
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Timing::Start => "start",
            Timing::End => "end",
            Timing::Error => "error",
            Timing::StartWithStreamInput => "start_with_stream_input",
            Timing::EndWithStreamOutput => "end_with_stream_output",
        })
    }
}

/// Set of timings a hook wants to be called for.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings(u8);

impl Timings {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b1_1111);

    pub const fn singleton(timing: Timing) -> Self {
        Self(1 << timing as u8)
    }

    pub const fn contains(self, timing: Timing) -> bool {
        self.0 & Self::singleton(timing).0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl From<Timing> for Timings {
    fn from(timing: Timing) -> Self {
        Self::singleton(timing)
    }
}

impl BitOr for Timings {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOr<Timing> for Timings {
    type Output = Self;

    fn bitor(self, rhs: Timing) -> Self::Output {
        self.union(Self::singleton(rhs))
    }
}

impl BitOrAssign for Timings {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One lifecycle event as delivered to a single hook.
#[derive(Debug)]
pub enum CallbackEvent<'a> {
    Start(&'a Payload),
    End(&'a Payload),
    Error(&'a ExecutionError),
    StartStream(StreamReader<Frame>),
    EndStream(StreamReader<Frame>),
}

impl CallbackEvent<'_> {
    pub fn timing(&self) -> Timing {
        match self {
            CallbackEvent::Start(_) => Timing::Start,
            CallbackEvent::End(_) => Timing::End,
            CallbackEvent::Error(_) => Timing::Error,
            CallbackEvent::StartStream(_) => Timing::StartWithStreamInput,
            CallbackEvent::EndStream(_) => Timing::EndWithStreamOutput,
        }
    }

    /// Call the `hook` method matching this event.
    pub async fn deliver(self, hook: &dyn CallbackHook, ctx: &CallContext, info: &RunInfo) {
        match self {
            CallbackEvent::Start(input) => hook.on_start(ctx, info, input).await,
            CallbackEvent::End(output) => hook.on_end(ctx, info, output).await,
            CallbackEvent::Error(error) => hook.on_error(ctx, info, error).await,
            CallbackEvent::StartStream(input) => {
                hook.on_start_with_stream_input(ctx, info, input).await
            }
            CallbackEvent::EndStream(output) => {
                hook.on_end_with_stream_output(ctx, info, output).await
            }
        }
    }
}

/// Lifecycle observer. Every method defaults to a no-op; stream copies are closed by default.
#[async_trait]
pub trait CallbackHook: Send + Sync {
    /// Timings the dispatcher should deliver. No stream copy is made for a timing left out.
    ///
    /// Defaults to every timing. A hook that ignores streams should narrow this: otherwise
    /// each streaming step tees a copy for it, and stream output also spawns a task, only for
    /// the default method to close the copy at once.
    fn interests(&self) -> Timings {
        Timings::ALL
    }

    async fn on_start(&self, _ctx: &CallContext, _info: &RunInfo, _input: &Payload) {}

    async fn on_end(&self, _ctx: &CallContext, _info: &RunInfo, _output: &Payload) {}

    async fn on_error(&self, _ctx: &CallContext, _info: &RunInfo, _error: &ExecutionError) {}

    async fn on_start_with_stream_input(
        &self,
        _ctx: &CallContext,
        _info: &RunInfo,
        input: StreamReader<Frame>,
    ) {
        input.close();
    }

    async fn on_end_with_stream_output(
        &self,
        _ctx: &CallContext,
        _info: &RunInfo,
        output: StreamReader<Frame>,
    ) {
        output.close();
    }
}

/// Which steps a registration observes.
#[derive(Clone)]
pub enum RunFilter {
    All,
    /// Only the pipeline being invoked (depth 0), not its nodes or nested pipelines.
    TopLevel,
    Name(String),
    Kind(NodeKind),
    Custom(Arc<dyn Fn(&RunInfo) -> bool + Send + Sync>),
}

impl RunFilter {
    pub fn custom(predicate: impl Fn(&RunInfo) -> bool + Send + Sync + 'static) -> Self {
        RunFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, info: &RunInfo) -> bool {
        match self {
            RunFilter::All => true,
            RunFilter::TopLevel => info.is_top_level(),
            RunFilter::Name(name) => info.name == *name,
            RunFilter::Kind(kind) => info.kind == *kind,
            RunFilter::Custom(predicate) => predicate(info),
        }
    }
}

impl fmt::Debug for RunFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFilter::All => f.write_str("All"),
            RunFilter::TopLevel => f.write_str("TopLevel"),
            RunFilter::Name(name) => f.debug_tuple("Name").field(name).finish(),
            RunFilter::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            RunFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A hook attached to a pipeline (or to one call) together with its filter.
#[derive(Clone)]
pub struct HookRegistration {
    hook: Arc<dyn CallbackHook>,
    filter: RunFilter,
}

impl HookRegistration {
    pub fn new(hook: impl CallbackHook + 'static) -> Self {
        Self::from_arc(Arc::new(hook))
    }

    pub fn from_arc(hook: Arc<dyn CallbackHook>) -> Self {
        Self {
            hook,
            filter: RunFilter::All,
        }
    }

    pub fn filter(mut self, filter: RunFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn hook(&self) -> &Arc<dyn CallbackHook> {
        &self.hook
    }

    pub(crate) fn wants(&self, info: &RunInfo, timing: Timing) -> bool {
        self.hook.interests().contains(timing) && self.filter.matches(info)
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("interests", &self.hook.interests())
            .field("filter", &self.filter)
            .finish()
    }
}
