//! Callback-instrumented pipelines over tee-able streams.
//!
//! A [`Pipeline`] chains scalar and streaming nodes. Hooks registered on the pipeline (or on
//! one call through [`CallContext::with_hook`]) observe every step: inline for start, end and
//! error, and on a private copy of the stream for streamed output, so observing a stream never
//! consumes or delays the caller's copy.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use hookline_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let log = Arc::clone(&seen);
//! let pipeline = Pipeline::builder("echo")
//!     .node(NodeSpec::lambda("echo", |_ctx, input: Flow| async move {
//!         input.into_payload().await
//!     }))
//!     .hook(
//!         HookRegistration::new(CallbackHandler::new().on_end(move |_, info, output| {
//!             log.lock().unwrap().push(format!("{}: {:?}", info.name, output.as_text()));
//!         }))
//!         .filter(RunFilter::TopLevel),
//!     )
//!     .compile()?;
//!
//! let out = pipeline.invoke(&CallContext::new(), "hello").await?;
//! assert_eq!(out.as_scalar(), Some(&Payload::text("hello")));
//! assert_eq!(*seen.lock().unwrap(), vec!["echo: Some(\"hello\")"]);
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
/// Messages and the chat model contract.
pub mod chat;
pub mod context;
/// Error types for streams, nodes, pipeline construction and invocation.
pub mod errors;
pub mod node;
/// Process-wide `tracing` setup.
pub mod observability;
pub mod payload;
pub mod pipeline;
pub mod prelude;
pub mod stream;
/// Tool schemas, function tools and the tools node.
pub mod tool;

pub use callbacks::{
    CallbackEvent, CallbackHandler, CallbackHook, HookRegistration, NodeKind, RunFilter, RunInfo,
    Timing, Timings,
};
pub use chat::{ChatModel, Message, Role, ToolCall};
pub use context::CallContext;
pub use errors::{ConstructionError, ExecutionError, NodeError, SendError, StreamError};
pub use node::{Callable, Flow, InputShape, Invoke, InvokeStream, Node, NodeSpec, Shape};
pub use observability::init_observability;
pub use payload::{Frame, Payload};
pub use pipeline::{Pipeline, PipelineBuilder, RunOptions};
pub use stream::{CloseHandle, StreamReader, StreamWriter, pipe};
pub use tool::{FunctionTool, ParamType, ParameterInfo, Tool, ToolInfo, ToolsNode};
