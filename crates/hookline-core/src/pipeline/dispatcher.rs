use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Compiled;
use crate::callbacks::{CallbackEvent, CallbackHook, RunInfo, Timing};
use crate::context::CallContext;
use crate::errors::{ExecutionError, NodeError, StreamError};
use crate::node::{Flow, Node};
use crate::payload::Frame;
use crate::stream::StreamReader;

/// Run every node of `pipeline` in order, reporting the pipeline itself at `parent.depth()`
/// and its nodes one level below.
pub(super) async fn run(
    pipeline: &Compiled,
    parent: &CallContext,
    input: Flow,
) -> Result<Flow, ExecutionError> {
    let scope = parent.enter(&pipeline.hooks);
    let info = pipeline.info.at_depth(parent.depth());
    let deadline = pipeline
        .options
        .timeout
        .map(|limit| Deadline::arm(limit, scope.cancellation_token().clone()));
    debug!(
        event = "pipeline.started",
        domain = "dispatcher",
        pipeline = %info.name,
        invocation_id = %scope.invocation_id(),
        depth = info.depth,
        input = ?input.shape(),
        hooks = scope.hooks().len()
    );

    let input = start(&scope, &info, input).await;
    let outcome = match (steps(&pipeline.nodes, &scope.descend(), input).await, &deadline) {
        (Err(ExecutionError::Cancelled), Some(deadline)) if deadline.expired() => {
            Err(ExecutionError::TimedOut(deadline.limit))
        }
        (other, _) => other,
    };

    match outcome {
        Ok(flow) => {
            let flow = match (flow, deadline) {
                (Flow::Stream(stream), Some(deadline)) => {
                    Flow::Stream(deadline.bind(stream, parent))
                }
                (flow, Some(deadline)) => {
                    deadline.disarm();
                    flow
                }
                (flow, None) => flow,
            };
            debug!(
                event = "pipeline.finished",
                domain = "dispatcher",
                pipeline = %info.name,
                invocation_id = %scope.invocation_id(),
                output = ?flow.shape()
            );
            Ok(end(&scope, &info, flow).await)
        }
        Err(err) => {
            if let Some(deadline) = deadline {
                deadline.disarm();
            }
            warn!(
                event = "pipeline.failed",
                domain = "dispatcher",
                pipeline = %info.name,
                invocation_id = %scope.invocation_id(),
                error = %err
            );
            error(&scope, &info, &err).await;
            Err(err)
        }
    }
}

async fn steps(nodes: &[Node], ctx: &CallContext, input: Flow) -> Result<Flow, ExecutionError> {
    let mut flow = input;
    for node in nodes {
        flow = step(node, ctx, flow).await?;
    }
    Ok(flow)
}

async fn step(node: &Node, ctx: &CallContext, input: Flow) -> Result<Flow, ExecutionError> {
    let info = node.info().at_depth(ctx.depth());
    let reports = node.reports_events();
    if ctx.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }

    let result = execute(node, ctx, &info, reports, input).await;

    match result {
        Ok(output) => {
            debug!(
                event = "node.finished",
                domain = "dispatcher",
                node = %info.name,
                output = ?output.shape()
            );
            Ok(if reports { end(ctx, &info, output).await } else { output })
        }
        Err(err) => {
            debug!(
                event = "node.failed",
                domain = "dispatcher",
                node = %info.name,
                error = %err
            );
            if reports {
                error(ctx, &info, &err).await;
            }
            Err(err)
        }
    }
}

async fn execute(
    node: &Node,
    ctx: &CallContext,
    info: &RunInfo,
    reports: bool,
    input: Flow,
) -> Result<Flow, ExecutionError> {
    let input = input
        .adapt(node.input_shape())
        .await
        .map_err(|err| node_failure(info, err))?;
    let input = if reports { start(ctx, info, input).await } else { input };
    debug!(
        event = "node.started",
        domain = "dispatcher",
        node = %info.name,
        kind = %info.kind,
        depth = info.depth
    );
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ExecutionError::Cancelled),
        out = node.execute(ctx, input) => out.map_err(|err| node_failure(info, err)),
    }
}

fn node_failure(info: &RunInfo, err: NodeError) -> ExecutionError {
    match err {
        NodeError::Cancelled => ExecutionError::Cancelled,
        other => ExecutionError::node(info.name.clone(), other),
    }
}

/// Inline start hooks. Stream input is tee'd once per interested hook before any hook runs.
async fn start(ctx: &CallContext, info: &RunInfo, input: Flow) -> Flow {
    match input {
        Flow::Scalar(payload) => {
            for reg in ctx.hooks().iter().filter(|r| r.wants(info, Timing::Start)) {
                notify(reg.hook().as_ref(), ctx, info, CallbackEvent::Start(&payload)).await;
            }
            Flow::Scalar(payload)
        }
        Flow::Stream(stream) => {
            let copies: Vec<_> = ctx
                .hooks()
                .iter()
                .filter(|r| r.wants(info, Timing::StartWithStreamInput))
                .map(|r| (Arc::clone(r.hook()), stream.tee()))
                .collect();
            for (hook, copy) in copies {
                notify(hook.as_ref(), ctx, info, CallbackEvent::StartStream(copy)).await;
            }
            Flow::Stream(stream)
        }
    }
}

/// Inline end hooks for scalar output; one background drain per interested hook for streams.
async fn end(ctx: &CallContext, info: &RunInfo, output: Flow) -> Flow {
    match output {
        Flow::Scalar(payload) => {
            for reg in ctx.hooks().iter().filter(|r| r.wants(info, Timing::End)) {
                notify(reg.hook().as_ref(), ctx, info, CallbackEvent::End(&payload)).await;
            }
            Flow::Scalar(payload)
        }
        Flow::Stream(stream) => {
            for reg in ctx
                .hooks()
                .iter()
                .filter(|r| r.wants(info, Timing::EndWithStreamOutput))
            {
                let hook = Arc::clone(reg.hook());
                let copy = stream.tee();
                let ctx = ctx.clone();
                let info = info.clone();
                tokio::spawn(async move {
                    notify(hook.as_ref(), &ctx, &info, CallbackEvent::EndStream(copy)).await;
                });
            }
            Flow::Stream(stream)
        }
    }
}

async fn error(ctx: &CallContext, info: &RunInfo, err: &ExecutionError) {
    for reg in ctx.hooks().iter().filter(|r| r.wants(info, Timing::Error)) {
        notify(reg.hook().as_ref(), ctx, info, CallbackEvent::Error(err)).await;
    }
}

/// Deliver `event` to `hook`, containing any panic. A stream owned by the hook is dropped, and
/// so closed, while unwinding.
async fn notify(hook: &dyn CallbackHook, ctx: &CallContext, info: &RunInfo, event: CallbackEvent<'_>) {
    let timing = event.timing();
    let call = event.deliver(hook, ctx, info);
    if let Err(panic) = AssertUnwindSafe(call).catch_unwind().await {
        warn!(
            event = "hook.panicked",
            domain = "callbacks",
            node = %info.name,
            timing = %timing,
            message = %panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Timer that cancels an invocation scope once `limit` elapses.
struct Deadline {
    limit: Duration,
    expired: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn arm(limit: Duration, token: CancellationToken) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    flag.store(true, Ordering::SeqCst);
                    debug!(event = "pipeline.deadline_expired", domain = "dispatcher", limit_ms = limit.as_millis() as u64);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
        Self {
            limit,
            expired,
            timer,
        }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn disarm(self) {
        self.timer.abort();
    }

    /// Relay `source` to a new stream that stays bound by this deadline until drained. When
    /// the deadline cuts the source short, live readers get a timeout fault instead of a plain
    /// end of stream.
    fn bind(self, source: StreamReader<Frame>, ctx: &CallContext) -> StreamReader<Frame> {
        let (tx, rx) = ctx.pipe::<Frame>();
        tokio::spawn(async move {
            let mut source = source;
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = source.recv() => next,
                };
                match next {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        if self.expired() {
                            tx.fail(ExecutionError::TimedOut(self.limit).to_string());
                        }
                        break;
                    }
                    Err(StreamError::Fault(message)) => {
                        tx.fail(message);
                        break;
                    }
                    Err(StreamError::Closed) => break,
                }
            }
            source.close();
            self.disarm();
        });
        rx
    }
}
