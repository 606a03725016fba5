//! Common imports for building and instrumenting pipelines.
pub use crate::{
    CallContext, CallbackHandler, CallbackHook, ConstructionError, ExecutionError, Flow, Frame,
    HookRegistration, Message, NodeError, NodeKind, NodeSpec, Payload, Pipeline, Role, RunFilter,
    RunInfo, RunOptions, Shape, StreamReader, StreamWriter,
};
