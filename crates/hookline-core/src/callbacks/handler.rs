use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{CallbackHook, RunInfo, Timing, Timings};
use crate::context::CallContext;
use crate::errors::ExecutionError;
use crate::payload::{Frame, Payload};
use crate::stream::StreamReader;

type PayloadFn = Box<dyn Fn(&CallContext, &RunInfo, &Payload) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&CallContext, &RunInfo, &ExecutionError) + Send + Sync>;
type StreamFn =
    Box<dyn Fn(CallContext, RunInfo, StreamReader<Frame>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook assembled from optional closures; timings without a closure are not delivered.
///
/// ```
/// use hookline_core::callbacks::CallbackHandler;
///
/// let handler = CallbackHandler::new()
///     .on_start(|_ctx, info, input| println!("{} <- {:?}", info.name, input))
///     .on_end_with_stream_output(|_ctx, info, stream| async move {
///         let frames = stream.collect().await.unwrap_or_default();
///         println!("{} streamed {} frames", info.name, frames.len());
///     });
/// # let _ = handler;
/// ```
#[derive(Default)]
pub struct CallbackHandler {
    start: Option<PayloadFn>,
    end: Option<PayloadFn>,
    error: Option<ErrorFn>,
    start_stream: Option<StreamFn>,
    end_stream: Option<StreamFn>,
}

impl CallbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(
        mut self,
        f: impl Fn(&CallContext, &RunInfo, &Payload) + Send + Sync + 'static,
    ) -> Self {
        self.start = Some(Box::new(f));
        self
    }

    pub fn on_end(
        mut self,
        f: impl Fn(&CallContext, &RunInfo, &Payload) + Send + Sync + 'static,
    ) -> Self {
        self.end = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&CallContext, &RunInfo, &ExecutionError) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// The closure owns the stream copy; it is awaited inline before the step runs.
    pub fn on_start_with_stream_input<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CallContext, RunInfo, StreamReader<Frame>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_stream = Some(Box::new(move |ctx, info, stream| Box::pin(f(ctx, info, stream))));
        self
    }

    /// The closure owns the stream copy and runs in a background task.
    pub fn on_end_with_stream_output<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CallContext, RunInfo, StreamReader<Frame>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.end_stream = Some(Box::new(move |ctx, info, stream| Box::pin(f(ctx, info, stream))));
        self
    }
}

#[async_trait]
impl CallbackHook for CallbackHandler {
    fn interests(&self) -> Timings {
        let mut set = Timings::NONE;
        if self.start.is_some() {
            set |= Timing::Start.into();
        }
        if self.end.is_some() {
            set |= Timing::End.into();
        }
        if self.error.is_some() {
            set |= Timing::Error.into();
        }
        if self.start_stream.is_some() {
            set |= Timing::StartWithStreamInput.into();
        }
        if self.end_stream.is_some() {
            set |= Timing::EndWithStreamOutput.into();
        }
        set
    }

    async fn on_start(&self, ctx: &CallContext, info: &RunInfo, input: &Payload) {
        if let Some(f) = &self.start {
            f(ctx, info, input);
        }
    }

    async fn on_end(&self, ctx: &CallContext, info: &RunInfo, output: &Payload) {
        if let Some(f) = &self.end {
            f(ctx, info, output);
        }
    }

    async fn on_error(&self, ctx: &CallContext, info: &RunInfo, error: &ExecutionError) {
        if let Some(f) = &self.error {
            f(ctx, info, error);
        }
    }

    async fn on_start_with_stream_input(
        &self,
        ctx: &CallContext,
        info: &RunInfo,
        input: StreamReader<Frame>,
    ) {
        match &self.start_stream {
            Some(f) => f(ctx.clone(), info.clone(), input).await,
            None => input.close(),
        }
    }

    async fn on_end_with_stream_output(
        &self,
        ctx: &CallContext,
        info: &RunInfo,
        output: StreamReader<Frame>,
    ) {
        match &self.end_stream {
            Some(f) => f(ctx.clone(), info.clone(), output).await,
            None => output.close(),
        }
    }
}
