//! # Nodes
//!
//! A node is one pipeline step. It is either scalar ([`Invoke`], one [`Payload`] out) or
//! streaming ([`InvokeStream`], a stream of [`Frame`]s out), never both. The shape is declared
//! on the [`NodeSpec`] and checked against the callable when the node is built, so a mismatch
//! surfaces as a [`ConstructionError`] rather than at run time.
//!
//! Nodes also declare the input they accept. A scalar value feeding a stream-input node is
//! wrapped into a one-frame stream; a stream feeding a scalar node is only allowed when the
//! node opts into concatenation with [`InputShape::Concat`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::callbacks::{NodeKind, RunInfo};
use crate::chat::{ChatModel, ChatNode};
use crate::context::CallContext;
use crate::errors::{ConstructionError, ExecutionError, NodeError};
use crate::payload::{Frame, Payload, concat_frames};
use crate::pipeline::Pipeline;
use crate::stream::StreamReader;
use crate::tool::ToolsNode;

/// Result shape of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    Stream,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shape::Scalar => "scalar output",
            Shape::Stream => "stream output",
        })
    }
}

/// Input a node accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    Scalar,
    Stream,
    /// Scalar input; an upstream stream is drained and concatenated first.
    Concat,
}

impl InputShape {
    pub fn accepts(self, upstream: Shape) -> bool {
        !matches!((self, upstream), (InputShape::Scalar, Shape::Stream))
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputShape::Scalar => "scalar input",
            InputShape::Stream => "stream input",
            InputShape::Concat => "scalar or concatenated stream input",
        })
    }
}

/// Data flowing between steps.
#[derive(Debug)]
pub enum Flow {
    Scalar(Payload),
    Stream(StreamReader<Frame>),
}

impl Flow {
    pub fn shape(&self) -> Shape {
        match self {
            Flow::Scalar(_) => Shape::Scalar,
            Flow::Stream(_) => Shape::Stream,
        }
    }

    /// Scalar view: streams are drained and concatenated.
    pub async fn into_payload(self) -> Result<Payload, NodeError> {
        match self {
            Flow::Scalar(payload) => Ok(payload),
            Flow::Stream(stream) => concat_frames(stream.collect().await?),
        }
    }

    /// Stream view: a scalar becomes a finished one-frame stream.
    pub fn into_stream(self) -> StreamReader<Frame> {
        match self {
            Flow::Scalar(payload) => StreamReader::once(Frame::new(payload)),
            Flow::Stream(stream) => stream,
        }
    }

    pub fn as_scalar(&self) -> Option<&Payload> {
        match self {
            Flow::Scalar(payload) => Some(payload),
            Flow::Stream(_) => None,
        }
    }

    /// Bring `self` into the form a node declared with `input` expects.
    pub(crate) async fn adapt(self, input: InputShape) -> Result<Flow, NodeError> {
        match (input, self) {
            (InputShape::Stream, Flow::Scalar(payload)) => {
                Ok(Flow::Stream(Flow::Scalar(payload).into_stream()))
            }
            (InputShape::Concat, flow @ Flow::Stream(_)) => Ok(Flow::Scalar(flow.into_payload().await?)),
            (InputShape::Scalar, Flow::Stream(_)) => Err(NodeError::invalid_input(
                "node accepts scalar input but received a stream",
            )),
            (_, flow) => Ok(flow),
        }
    }
}

impl From<Payload> for Flow {
    fn from(payload: Payload) -> Self {
        Flow::Scalar(payload)
    }
}

impl From<&str> for Flow {
    fn from(value: &str) -> Self {
        Flow::Scalar(Payload::text(value))
    }
}

impl From<String> for Flow {
    fn from(value: String) -> Self {
        Flow::Scalar(Payload::text(value))
    }
}

impl From<StreamReader<Frame>> for Flow {
    fn from(stream: StreamReader<Frame>) -> Self {
        Flow::Stream(stream)
    }
}

/// Scalar step contract.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, ctx: &CallContext, input: Flow) -> Result<Payload, NodeError>;
}

/// Streaming step contract. Produce frames through [`CallContext::pipe`] so cancellation
/// reaches the stream.
#[async_trait]
pub trait InvokeStream: Send + Sync {
    async fn stream(&self, ctx: &CallContext, input: Flow)
    -> Result<StreamReader<Frame>, NodeError>;
}

/// What a node runs.
#[derive(Clone)]
pub enum Callable {
    Invoke(Arc<dyn Invoke>),
    Stream(Arc<dyn InvokeStream>),
    /// A compiled pipeline run as one step; it reports its own events.
    Pipeline(Pipeline),
}

impl Callable {
    pub fn shape(&self) -> Shape {
        match self {
            Callable::Invoke(_) => Shape::Scalar,
            Callable::Stream(_) => Shape::Stream,
            Callable::Pipeline(pipeline) => pipeline.output_shape(),
        }
    }
}

struct Lambda<F>(F);

#[async_trait]
impl<F, Fut> Invoke for Lambda<F>
where
    F: Fn(CallContext, Flow) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, NodeError>> + Send + 'static,
{
    async fn invoke(&self, ctx: &CallContext, input: Flow) -> Result<Payload, NodeError> {
        (self.0)(ctx.clone(), input).await
    }
}

struct StreamLambda<F>(F);

#[async_trait]
impl<F, Fut> InvokeStream for StreamLambda<F>
where
    F: Fn(CallContext, Flow) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamReader<Frame>, NodeError>> + Send + 'static,
{
    async fn stream(
        &self,
        ctx: &CallContext,
        input: Flow,
    ) -> Result<StreamReader<Frame>, NodeError> {
        (self.0)(ctx.clone(), input).await
    }
}

struct Nested(Pipeline);

#[async_trait]
impl Invoke for Nested {
    async fn invoke(&self, ctx: &CallContext, input: Flow) -> Result<Payload, NodeError> {
        self.0.invoke(ctx, input).await.map_err(nested_error)?.into_payload().await
    }
}

#[async_trait]
impl InvokeStream for Nested {
    async fn stream(
        &self,
        ctx: &CallContext,
        input: Flow,
    ) -> Result<StreamReader<Frame>, NodeError> {
        Ok(self.0.invoke(ctx, input).await.map_err(nested_error)?.into_stream())
    }
}

fn nested_error(err: ExecutionError) -> NodeError {
    match err {
        ExecutionError::Cancelled => NodeError::Cancelled,
        other => NodeError::Failed(other.to_string()),
    }
}

/// Unvalidated node description; [`NodeSpec::build`] or pipeline compilation checks it.
#[derive(Clone)]
pub struct NodeSpec {
    name: String,
    kind: NodeKind,
    output: Shape,
    input: InputShape,
    callable: Callable,
}

impl NodeSpec {
    /// Node declared with `output`; building fails if `callable` has the other shape.
    pub fn new(name: impl Into<String>, kind: NodeKind, output: Shape, callable: Callable) -> Self {
        Self {
            name: name.into(),
            kind,
            output,
            input: InputShape::Scalar,
            callable,
        }
    }

    pub fn scalar(name: impl Into<String>, kind: NodeKind, call: impl Invoke + 'static) -> Self {
        Self::new(name, kind, Shape::Scalar, Callable::Invoke(Arc::new(call)))
    }

    pub fn streaming(
        name: impl Into<String>,
        kind: NodeKind,
        call: impl InvokeStream + 'static,
    ) -> Self {
        Self::new(name, kind, Shape::Stream, Callable::Stream(Arc::new(call)))
    }

    /// Scalar node from an async closure.
    pub fn lambda<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Flow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, NodeError>> + Send + 'static,
    {
        Self::scalar(name, NodeKind::Custom, Lambda(f))
    }

    /// Streaming node from an async closure.
    pub fn stream_lambda<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Flow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader<Frame>, NodeError>> + Send + 'static,
    {
        Self::streaming(name, NodeKind::Custom, StreamLambda(f))
    }

    /// Chat model node, scalar (`generate`) or streaming (`stream`).
    pub fn chat_model(name: impl Into<String>, model: Arc<dyn ChatModel>, output: Shape) -> Self {
        let node = Arc::new(ChatNode { model });
        let callable = match output {
            Shape::Scalar => Callable::Invoke(node),
            Shape::Stream => Callable::Stream(node),
        };
        Self::new(name, NodeKind::ChatModel, output, callable).accepts(InputShape::Concat)
    }

    /// Chat model node with the schemas of `tools` bound to the model before it is shared.
    pub fn chat_model_with_tools(
        name: impl Into<String>,
        mut model: impl ChatModel + 'static,
        tools: &ToolsNode,
        output: Shape,
    ) -> Result<Self, ConstructionError> {
        let name = name.into();
        model.bind_tools(&tools.infos()).map_err(|err| match err {
            ConstructionError::ToolsUnsupported { .. } => ConstructionError::ToolsUnsupported {
                node: name.clone(),
            },
            other => other,
        })?;
        Ok(Self::chat_model(name, Arc::new(model), output))
    }

    /// Tools node; accepts a streamed assistant reply by concatenating it.
    pub fn tools(name: impl Into<String>, tools: ToolsNode) -> Self {
        Self::scalar(name, NodeKind::Tools, tools).accepts(InputShape::Concat)
    }

    /// Embed a compiled pipeline as one step.
    pub fn pipeline(pipeline: Pipeline) -> Self {
        let name = pipeline.name().to_string();
        let (input, output) = (pipeline.input_shape(), pipeline.output_shape());
        Self::new(name, NodeKind::Pipeline, output, Callable::Pipeline(pipeline)).accepts(input)
    }

    pub fn accepts(mut self, input: InputShape) -> Self {
        self.input = input;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(self) -> Result<Node, ConstructionError> {
        if self.name.trim().is_empty() {
            return Err(ConstructionError::EmptyName);
        }
        let actual = self.callable.shape();
        if actual != self.output {
            return Err(ConstructionError::ShapeMismatch {
                node: self.name,
                declared: self.output,
                actual,
            });
        }
        let info = RunInfo::new(self.name, self.kind);
        let input = self.input;
        Ok(match self.callable {
            Callable::Invoke(call) => Node::Scalar(ScalarNode {
                info,
                input,
                call,
                reports_events: true,
            }),
            Callable::Stream(call) => Node::Streaming(StreamingNode {
                info,
                input,
                call,
                reports_events: true,
            }),
            Callable::Pipeline(pipeline) => match actual {
                Shape::Scalar => Node::Scalar(ScalarNode {
                    info,
                    input,
                    call: Arc::new(Nested(pipeline)),
                    reports_events: false,
                }),
                Shape::Stream => Node::Streaming(StreamingNode {
                    info,
                    input,
                    call: Arc::new(Nested(pipeline)),
                    reports_events: false,
                }),
            },
        })
    }
}

#[derive(Clone)]
pub struct ScalarNode {
    info: RunInfo,
    input: InputShape,
    call: Arc<dyn Invoke>,
    reports_events: bool,
}

#[derive(Clone)]
pub struct StreamingNode {
    info: RunInfo,
    input: InputShape,
    call: Arc<dyn InvokeStream>,
    reports_events: bool,
}

/// A validated step.
#[derive(Clone)]
pub enum Node {
    Scalar(ScalarNode),
    Streaming(StreamingNode),
}

impl Node {
    pub fn info(&self) -> &RunInfo {
        match self {
            Node::Scalar(n) => &n.info,
            Node::Streaming(n) => &n.info,
        }
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn input_shape(&self) -> InputShape {
        match self {
            Node::Scalar(n) => n.input,
            Node::Streaming(n) => n.input,
        }
    }

    pub fn output_shape(&self) -> Shape {
        match self {
            Node::Scalar(_) => Shape::Scalar,
            Node::Streaming(_) => Shape::Stream,
        }
    }

    /// False for embedded pipelines, which fire their own events.
    pub(crate) fn reports_events(&self) -> bool {
        match self {
            Node::Scalar(n) => n.reports_events,
            Node::Streaming(n) => n.reports_events,
        }
    }

    pub(crate) async fn execute(&self, ctx: &CallContext, input: Flow) -> Result<Flow, NodeError> {
        match self {
            Node::Scalar(n) => n.call.invoke(ctx, input).await.map(Flow::Scalar),
            Node::Streaming(n) => n.call.stream(ctx, input).await.map(Flow::Stream),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("info", self.info())
            .field("input", &self.input_shape())
            .field("output", &self.output_shape())
            .finish()
    }
}
