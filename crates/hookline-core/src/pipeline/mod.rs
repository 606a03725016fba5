//! # Pipelines
//!
//! A pipeline is an ordered chain of nodes compiled once and invoked many times. Compilation
//! checks every node and every link between consecutive nodes, so an invalid chain is a
//! [`ConstructionError`] and never an invocation failure.
//!
//! On `invoke` the dispatcher runs nodes in order and fires hook events around each of them.
//! The pipeline itself is reported as a step of kind [`NodeKind::Pipeline`] at the caller's
//! depth; its nodes are reported one level below. An embedded pipeline
//! ([`NodeSpec::pipeline`]) reports its own events, seen by its hooks and by the hooks of
//! every enclosing pipeline.

mod dispatcher;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callbacks::{HookRegistration, NodeKind, RunInfo};
use crate::context::CallContext;
use crate::errors::{ConstructionError, ExecutionError};
use crate::node::{Flow, InputShape, Node, NodeSpec, Shape};

/// Per-pipeline invocation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Deadline for one invocation. When it expires the invocation's token is cancelled:
    /// running nodes stop and a streamed result ends early.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

pub struct PipelineBuilder {
    name: String,
    nodes: Vec<NodeSpec>,
    hooks: Vec<HookRegistration>,
    options: RunOptions,
}

impl PipelineBuilder {
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    /// Hook observing every invocation of this pipeline.
    pub fn hook(mut self, registration: HookRegistration) -> Self {
        self.hooks.push(registration);
        self
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn compile(self) -> Result<Pipeline, ConstructionError> {
        if self.name.trim().is_empty() {
            return Err(ConstructionError::EmptyName);
        }
        if self.nodes.is_empty() {
            return Err(ConstructionError::EmptyPipeline {
                pipeline: self.name,
            });
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for spec in self.nodes {
            if !seen.insert(spec.name().to_string()) {
                return Err(ConstructionError::DuplicateNode {
                    pipeline: self.name,
                    node: spec.name().to_string(),
                });
            }
            nodes.push(spec.build()?);
        }

        for pair in nodes.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if !to.input_shape().accepts(from.output_shape()) {
                return Err(ConstructionError::IncompatibleLink {
                    from: from.name().to_string(),
                    to: to.name().to_string(),
                    output: from.output_shape(),
                    input: to.input_shape(),
                });
            }
        }

        debug!(
            event = "pipeline.compiled",
            domain = "pipeline",
            pipeline = %self.name,
            nodes = nodes.len(),
            hooks = self.hooks.len()
        );
        Ok(Pipeline(Arc::new(Compiled {
            info: RunInfo::new(self.name, NodeKind::Pipeline),
            nodes,
            hooks: self.hooks,
            options: self.options,
        })))
    }
}

struct Compiled {
    info: RunInfo,
    nodes: Vec<Node>,
    hooks: Vec<HookRegistration>,
    options: RunOptions,
}

/// Compiled, immutable pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline(Arc<Compiled>);

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            nodes: Vec::new(),
            hooks: Vec::new(),
            options: RunOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.0.info.name
    }

    /// Input accepted by the first node.
    pub fn input_shape(&self) -> InputShape {
        self.first().input_shape()
    }

    /// Output produced by the last node.
    pub fn output_shape(&self) -> Shape {
        self.last().output_shape()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.0.nodes
    }

    pub fn options(&self) -> &RunOptions {
        &self.0.options
    }

    /// Run the pipeline. A streamed result is returned undrained; hooks read their own copies.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        input: impl Into<Flow>,
    ) -> Result<Flow, ExecutionError> {
        dispatcher::run(&self.0, ctx, input.into()).await
    }

    // Compilation guarantees at least one node.
    fn first(&self) -> &Node {
        &self.0.nodes[0]
    }

    fn last(&self) -> &Node {
        &self.0.nodes[self.0.nodes.len() - 1]
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name())
            .field("nodes", &self.0.nodes)
            .field("hooks", &self.0.hooks)
            .field("options", &self.0.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::{Notify, oneshot};
    use tokio_util::sync::CancellationToken;

    use crate::callbacks::{CallbackHandler, CallbackHook, RunFilter};
    use crate::errors::{NodeError, StreamError};
    use crate::node::{Callable, InvokeStream};
    use crate::payload::{Frame, Payload};
    use crate::stream::StreamReader;

    const BOUND: Duration = Duration::from_secs(2);

    type Log = Arc<Mutex<Vec<String>>>;

    fn echo() -> NodeSpec {
        NodeSpec::lambda("echo", |_ctx, input: Flow| async move { input.into_payload().await })
    }

    fn letters(name: &str, items: &'static [&'static str]) -> NodeSpec {
        NodeSpec::stream_lambda(name, move |ctx, _input| async move {
            let (tx, rx) = ctx.pipe::<Frame>();
            tokio::spawn(async move {
                for item in items {
                    if tx.send(Frame::text(*item)).is_err() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            });
            Ok(rx)
        })
    }

    fn recording(log: &Log) -> CallbackHandler {
        let (start, end, failed) = (Arc::clone(log), Arc::clone(log), Arc::clone(log));
        CallbackHandler::new()
            .on_start(move |_, info, input| {
                start.lock().unwrap().push(format!("Start({}:{})", info.name, text(input)));
            })
            .on_end(move |_, info, output| {
                end.lock().unwrap().push(format!("End({}:{})", info.name, text(output)));
            })
            .on_error(move |_, info, _| {
                failed.lock().unwrap().push(format!("Error({})", info.name));
            })
    }

    fn text(payload: &Payload) -> String {
        payload.as_text().unwrap_or_default().to_string()
    }

    async fn read_texts(stream: StreamReader<Frame>) -> Vec<String> {
        stream
            .collect()
            .await
            .unwrap()
            .iter()
            .filter_map(|f| f.as_text().map(String::from))
            .collect()
    }

    /// Frames read and faults seen before the end of `stream`.
    async fn drain(mut stream: StreamReader<Frame>) -> (Vec<String>, usize) {
        let (mut texts, mut faults) = (Vec::new(), 0);
        loop {
            match stream.recv().await {
                Ok(Some(frame)) => texts.push(frame.as_text().unwrap_or_default().to_string()),
                Err(StreamError::Fault(_)) => faults += 1,
                Ok(None) | Err(StreamError::Closed) => break,
            }
        }
        (texts, faults)
    }

    fn upper() -> NodeSpec {
        NodeSpec::stream_lambda("upper", |ctx, input: Flow| async move {
            let mut source = input.into_stream();
            let (tx, rx) = ctx.pipe::<Frame>();
            tokio::spawn(async move {
                while let Ok(Some(frame)) = source.recv().await {
                    let upper = frame.as_text().unwrap_or_default().to_uppercase();
                    let _ = tx.send(Frame::text(upper));
                }
            });
            Ok(rx)
        })
        .accepts(InputShape::Stream)
    }

    #[tokio::test]
    async fn echo_reports_start_then_end() {
        let log = Log::default();
        let pipeline = Pipeline::builder("echo_pipeline")
            .node(echo())
            .hook(HookRegistration::new(recording(&log)).filter(RunFilter::TopLevel))
            .compile()
            .unwrap();

        let out = pipeline.invoke(&CallContext::new(), "hello").await.unwrap();

        assert_eq!(out.as_scalar(), Some(&Payload::text("hello")));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["Start(echo_pipeline:hello)", "End(echo_pipeline:hello)"]
        );
    }

    #[tokio::test]
    async fn unfiltered_hook_sees_pipeline_and_nodes() {
        let log = Log::default();
        let pipeline = Pipeline::builder("p")
            .node(echo())
            .hook(HookRegistration::new(recording(&log)))
            .compile()
            .unwrap();
        pipeline.invoke(&CallContext::new(), "x").await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["Start(p:x)", "Start(echo:x)", "End(echo:x)", "End(p:x)"]
        );
    }

    #[tokio::test]
    async fn slow_stream_hook_does_not_delay_caller() {
        let release = Arc::new(Notify::new());
        let (seen_tx, seen_rx) = oneshot::channel();
        let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
        let gate = Arc::clone(&release);
        let hook = CallbackHandler::new().on_end_with_stream_output(move |_, _, stream| {
            let gate = Arc::clone(&gate);
            let seen_tx = Arc::clone(&seen_tx);
            async move {
                gate.notified().await;
                let texts = read_texts(stream).await;
                if let Some(tx) = seen_tx.lock().unwrap().take() {
                    let _ = tx.send(texts);
                }
            }
        });
        let pipeline = Pipeline::builder("letters")
            .node(letters("abc", &["a", "b", "c"]))
            .hook(HookRegistration::new(hook).filter(RunFilter::TopLevel))
            .compile()
            .unwrap();

        let Flow::Stream(stream) = pipeline.invoke(&CallContext::new(), "go").await.unwrap() else {
            panic!("expected stream output");
        };
        let caller = tokio::time::timeout(BOUND, read_texts(stream))
            .await
            .expect("caller not blocked by hook");
        assert_eq!(caller, vec!["a", "b", "c"]);

        release.notify_one();
        let hooked = tokio::time::timeout(BOUND, seen_rx).await.unwrap().unwrap();
        assert_eq!(hooked, vec!["a", "b", "c"]);
    }

    struct Panicking;

    #[async_trait]
    impl CallbackHook for Panicking {
        async fn on_start(&self, _: &CallContext, _: &RunInfo, _: &Payload) {
            panic!("start hook panicked");
        }

        async fn on_end_with_stream_output(
            &self,
            _: &CallContext,
            _: &RunInfo,
            output: StreamReader<Frame>,
        ) {
            let mut output = output;
            let _ = output.recv().await;
            panic!("drain hook panicked");
        }
    }

    #[tokio::test]
    async fn panicking_hook_leaves_result_intact() {
        let (released_tx, released_rx) = oneshot::channel();
        let released_tx = Arc::new(Mutex::new(Some(released_tx)));
        let pipeline = Pipeline::builder("letters")
            .node(NodeSpec::stream_lambda("abc", move |ctx, _input| {
                let released_tx = Arc::clone(&released_tx);
                async move {
                    let (tx, rx) = ctx.pipe::<Frame>();
                    tokio::spawn(async move {
                        for item in ["a", "b", "c"] {
                            let _ = tx.send(Frame::text(item));
                        }
                        tx.closed().await;
                        if let Some(done) = released_tx.lock().unwrap().take() {
                            let _ = done.send(tx.is_closed());
                        }
                    });
                    Ok(rx)
                }
            }))
            .hook(HookRegistration::new(Panicking))
            .compile()
            .unwrap();
        let out = pipeline.invoke(&CallContext::new(), "go").await.unwrap();
        let texts = tokio::time::timeout(BOUND, read_texts(out.into_stream()))
            .await
            .unwrap();
        assert_eq!(texts, vec!["a", "b", "c"]);

        // Every copy, including the ones dropped by panicking drains, is gone.
        let released = tokio::time::timeout(BOUND, released_rx)
            .await
            .expect("producer released")
            .unwrap();
        assert!(released);
    }

    #[tokio::test]
    async fn producer_fault_reaches_caller_and_hook_once() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
        let hook = CallbackHandler::new().on_end_with_stream_output(move |_, _, stream| {
            let seen_tx = Arc::clone(&seen_tx);
            async move {
                let seen = drain(stream).await;
                if let Some(tx) = seen_tx.lock().unwrap().take() {
                    let _ = tx.send(seen);
                }
            }
        });
        let pipeline = Pipeline::builder("flaky")
            .node(NodeSpec::stream_lambda("broken_feed", |ctx, _input| async move {
                let (tx, rx) = ctx.pipe::<Frame>();
                tokio::spawn(async move {
                    let _ = tx.send(Frame::text("a"));
                    tokio::task::yield_now().await;
                    tx.fail("upstream broke");
                });
                Ok(rx)
            }))
            .hook(HookRegistration::new(hook).filter(RunFilter::TopLevel))
            .compile()
            .unwrap();

        let out = pipeline.invoke(&CallContext::new(), "go").await.unwrap();
        let caller = tokio::time::timeout(BOUND, drain(out.into_stream())).await.unwrap();
        assert_eq!(caller, (vec!["a".to_string()], 1));
        let hooked = tokio::time::timeout(BOUND, seen_rx).await.unwrap().unwrap();
        assert_eq!(hooked, (vec!["a".to_string()], 1));
    }

    #[tokio::test]
    async fn stream_input_hook_reads_its_own_copy() {
        let log = Log::default();
        let sink = Arc::clone(&log);
        let hook = CallbackHandler::new().on_start_with_stream_input(move |_, info, stream| {
            let sink = Arc::clone(&sink);
            async move {
                let texts = read_texts(stream).await;
                sink.lock().unwrap().push(format!("{}:{}", info.name, texts.join(",")));
            }
        });
        let pipeline = Pipeline::builder("p")
            .node(letters("abc", &["a", "b", "c"]))
            .node(upper())
            .hook(HookRegistration::new(hook))
            .compile()
            .unwrap();

        let out = pipeline.invoke(&CallContext::new(), "go").await.unwrap();
        let texts = tokio::time::timeout(BOUND, read_texts(out.into_stream()))
            .await
            .unwrap();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(*log.lock().unwrap(), vec!["upper:a,b,c"]);
    }

    #[tokio::test]
    async fn cancellation_stops_running_node() {
        let log = Log::default();
        let pipeline = Pipeline::builder("slow")
            .node(NodeSpec::lambda("sleepy", |_ctx, _input| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Payload::Empty)
            }))
            .hook(HookRegistration::new(recording(&log)).filter(RunFilter::TopLevel))
            .compile()
            .unwrap();

        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = tokio::time::timeout(BOUND, pipeline.invoke(&ctx, "x")).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(result.unwrap_err(), ExecutionError::Cancelled);
        assert_eq!(*log.lock().unwrap(), vec!["Start(slow:x)", "Error(slow)"]);
    }

    #[tokio::test]
    async fn cancellation_ends_returned_stream() {
        let pipeline = Pipeline::builder("endless")
            .node(NodeSpec::stream_lambda("ticks", |ctx, _input| async move {
                let (tx, rx) = ctx.pipe::<Frame>();
                tokio::spawn(async move {
                    let mut n = 0u64;
                    while tx.send(Frame::text("tick").with_index(n)).is_ok() {
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                Ok(rx)
            }))
            .compile()
            .unwrap();
        let ctx = CallContext::new();
        let mut stream = pipeline.invoke(&ctx, "go").await.unwrap().into_stream();
        assert!(stream.recv().await.unwrap().is_some());
        ctx.cancel();
        let end = tokio::time::timeout(BOUND, stream.recv()).await.unwrap();
        assert_eq!(end, Ok(None));
    }

    struct Silent;

    #[async_trait]
    impl InvokeStream for Silent {
        async fn stream(
            &self,
            _ctx: &CallContext,
            _input: Flow,
        ) -> Result<StreamReader<Frame>, NodeError> {
            Ok(std::iter::empty().collect())
        }
    }

    #[test]
    fn scalar_declared_streaming_callable_fails_compile() {
        let liar = NodeSpec::new(
            "liar",
            NodeKind::Custom,
            Shape::Scalar,
            Callable::Stream(Arc::new(Silent)),
        );
        let err = Pipeline::builder("p").node(liar).compile().unwrap_err();
        assert_eq!(
            err,
            ConstructionError::ShapeMismatch {
                node: "liar".into(),
                declared: Shape::Scalar,
                actual: Shape::Stream,
            }
        );
    }

    #[test]
    fn compile_validates_structure() {
        assert_eq!(
            Pipeline::builder("").node(echo()).compile().unwrap_err(),
            ConstructionError::EmptyName
        );
        assert_eq!(
            Pipeline::builder("p").compile().unwrap_err(),
            ConstructionError::EmptyPipeline {
                pipeline: "p".into()
            }
        );
        assert_eq!(
            Pipeline::builder("p").node(echo()).node(echo()).compile().unwrap_err(),
            ConstructionError::DuplicateNode {
                pipeline: "p".into(),
                node: "echo".into()
            }
        );
    }

    #[test]
    fn stream_into_scalar_input_is_rejected() {
        let err = Pipeline::builder("p")
            .node(letters("s", &["a"]))
            .node(echo())
            .compile()
            .unwrap_err();
        assert_eq!(
            err,
            ConstructionError::IncompatibleLink {
                from: "s".into(),
                to: "echo".into(),
                output: Shape::Stream,
                input: InputShape::Scalar,
            }
        );
    }

    #[tokio::test]
    async fn concat_input_joins_upstream_stream() {
        let pipeline = Pipeline::builder("p")
            .node(letters("s", &["a", "b", "c"]))
            .node(echo().accepts(InputShape::Concat))
            .compile()
            .unwrap();
        let out = pipeline.invoke(&CallContext::new(), "go").await.unwrap();
        assert_eq!(out.as_scalar(), Some(&Payload::text("abc")));
    }

    #[tokio::test]
    async fn scalar_feeds_stream_input_as_one_frame() {
        let pipeline = Pipeline::builder("p")
            .node(echo())
            .node(upper())
            .compile()
            .unwrap();
        let out = pipeline.invoke(&CallContext::new(), "hi").await.unwrap();
        assert_eq!(read_texts(out.into_stream()).await, vec!["HI"]);
    }

    #[tokio::test]
    async fn entry_stream_into_scalar_node_is_invalid_input() {
        let pipeline = Pipeline::builder("p").node(echo()).compile().unwrap();
        let input: StreamReader<Frame> = std::iter::once(Frame::text("a")).collect();
        let err = pipeline.invoke(&CallContext::new(), input).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Node {
                source: NodeError::InvalidInput(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn node_failure_reaches_node_and_pipeline_hooks() {
        let log = Log::default();
        let pipeline = Pipeline::builder("p")
            .node(NodeSpec::lambda("broken", |_ctx, _input| async {
                Err(NodeError::failed("boom"))
            }))
            .hook(HookRegistration::new(recording(&log)))
            .compile()
            .unwrap();
        let err = pipeline.invoke(&CallContext::new(), "x").await.unwrap_err();
        assert_eq!(err.node_name(), Some("broken"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["Start(p:x)", "Start(broken:x)", "Error(broken)", "Error(p)"]
        );
    }

    #[tokio::test]
    async fn per_call_hook_only_sees_its_invocation() {
        let log = Log::default();
        let pipeline = Pipeline::builder("p").node(echo()).compile().unwrap();
        let ctx = CallContext::new()
            .with_hook(HookRegistration::new(recording(&log)).filter(RunFilter::TopLevel));
        pipeline.invoke(&ctx, "first").await.unwrap();
        pipeline.invoke(&CallContext::new(), "second").await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["Start(p:first)", "End(p:first)"]);
    }

    #[tokio::test]
    async fn nested_pipeline_reports_one_level_down() {
        let inner_log = Log::default();
        let outer_log = Log::default();
        let inner = Pipeline::builder("inner")
            .node(echo())
            .hook(HookRegistration::new(recording(&inner_log)).filter(RunFilter::TopLevel))
            .compile()
            .unwrap();
        let depths = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&depths);
        let outer = Pipeline::builder("outer")
            .node(NodeSpec::pipeline(inner))
            .hook(
                HookRegistration::new(recording(&outer_log))
                    .filter(RunFilter::Name("inner".into())),
            )
            .hook(HookRegistration::new(CallbackHandler::new().on_start(move |_, info, _| {
                sink.lock().unwrap().push((info.name.clone(), info.depth));
            })))
            .compile()
            .unwrap();

        let out = outer.invoke(&CallContext::new(), "hey").await.unwrap();
        assert_eq!(out.as_scalar(), Some(&Payload::text("hey")));
        // The inner pipeline runs at depth 1, so its TopLevel hook never fires.
        assert!(inner_log.lock().unwrap().is_empty());
        assert_eq!(*outer_log.lock().unwrap(), vec!["Start(inner:hey)", "End(inner:hey)"]);
        assert_eq!(
            *depths.lock().unwrap(),
            vec![("outer".to_string(), 0), ("inner".to_string(), 1), ("echo".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn timeout_cancels_invocation() {
        let limit = Duration::from_millis(30);
        let pipeline = Pipeline::builder("p")
            .node(NodeSpec::lambda("sleepy", |_ctx, _input| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Payload::Empty)
            }))
            .options(RunOptions {
                timeout: Some(limit),
            })
            .compile()
            .unwrap();
        let ctx = CallContext::new();
        let result = tokio::time::timeout(BOUND, pipeline.invoke(&ctx, "x")).await.unwrap();
        assert_eq!(result.unwrap_err(), ExecutionError::TimedOut(limit));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_faults_streamed_result() {
        let limit = Duration::from_millis(30);
        let pipeline = Pipeline::builder("p")
            .node(NodeSpec::stream_lambda("stalls", |ctx, _input| async move {
                let (tx, rx) = ctx.pipe::<Frame>();
                tokio::spawn(async move {
                    let _ = tx.send(Frame::text("first"));
                    tx.cancelled().await;
                });
                Ok(rx)
            }))
            .options(RunOptions {
                timeout: Some(limit),
            })
            .compile()
            .unwrap();
        let ctx = CallContext::new();
        let mut stream = pipeline.invoke(&ctx, "go").await.unwrap().into_stream();
        assert_eq!(stream.recv().await, Ok(Some(Frame::text("first"))));
        let cut = tokio::time::timeout(BOUND, stream.recv()).await.unwrap();
        assert_eq!(
            cut,
            Err(StreamError::Fault(ExecutionError::TimedOut(limit).to_string()))
        );
        assert_eq!(stream.recv().await, Ok(None));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn stream_drained_in_time_ends_cleanly() {
        let pipeline = Pipeline::builder("p")
            .node(letters("abc", &["a", "b", "c"]))
            .options(RunOptions {
                timeout: Some(Duration::from_secs(30)),
            })
            .compile()
            .unwrap();
        let out = pipeline.invoke(&CallContext::new(), "go").await.unwrap();
        let drained = tokio::time::timeout(BOUND, drain(out.into_stream())).await.unwrap();
        assert_eq!(drained, (vec!["a".into(), "b".into(), "c".into()], 0));
    }

    #[tokio::test]
    async fn hooks_can_annotate_context() {
        let pipeline = Pipeline::builder("p")
            .node(echo())
            .hook(HookRegistration::new(CallbackHandler::new().on_start(|ctx, info, _| {
                ctx.annotate(format!("seen.{}", info.name), serde_json::json!(info.depth));
            })))
            .compile()
            .unwrap();
        let ctx = CallContext::new();
        pipeline.invoke(&ctx, "x").await.unwrap();
        assert_eq!(ctx.annotation("seen.echo"), Some(serde_json::json!(1)));
        assert_eq!(ctx.annotation("seen.p"), Some(serde_json::json!(0)));
    }
}
