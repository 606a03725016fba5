//! Tool contracts: schema-described parameters, typed function tools, and the tools node that
//! dispatches a model's tool calls.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::chat::{Message, Role};
use crate::context::CallContext;
use crate::errors::{ConstructionError, NodeError};
use crate::node::{Flow, Invoke};
use crate::payload::Payload;

/// JSON type of a tool parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParameterInfo {
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Name, description and parameters a tool exposes to a model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParameterInfo>,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParameterInfo) -> Self {
        self.params.push(param);
        self
    }

    pub fn validate(&self) -> Result<(), ConstructionError> {
        let invalid = |message: String| ConstructionError::InvalidSchema {
            tool: self.name.clone(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("tool name must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for param in &self.params {
            if param.name.trim().is_empty() {
                return Err(invalid("parameter name must not be empty".into()));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(format!("parameter `{}` declared twice", param.name)));
            }
        }
        Ok(())
    }

    /// Check call arguments against the declared parameters. `null` counts as no arguments;
    /// undeclared fields are left to the tool.
    pub fn check_arguments(&self, args: &Value) -> Result<(), NodeError> {
        let empty = Map::new();
        let fields = match args {
            Value::Object(fields) => fields,
            Value::Null => &empty,
            other => {
                return Err(NodeError::invalid_input(format!(
                    "tool `{}` expects an object of arguments, got {other}",
                    self.name
                )));
            }
        };
        for param in &self.params {
            match fields.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(NodeError::invalid_input(format!(
                        "tool `{}` is missing required argument `{}`",
                        self.name, param.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.kind.matches(value) => {
                    return Err(NodeError::invalid_input(format!(
                        "argument `{}` of tool `{}` must be {}, got {value}",
                        param.name, self.name, param.kind
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Function-calling signature in JSON Schema form.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                let mut prop = json!({ "type": p.kind.as_str() });
                if !p.description.is_empty() {
                    prop["description"] = json!(p.description);
                }
                (p.name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

/// A callable tool. Returns its result as text, typically JSON.
#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> &ToolInfo;

    async fn invoke(&self, ctx: &CallContext, args: Value) -> Result<String, NodeError>;
}

/// Tool backed by an async closure over serde-typed arguments.
pub struct FunctionTool<A, F> {
    info: ToolInfo,
    call: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F, Fut> FunctionTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, NodeError>> + Send + 'static,
{
    pub fn new(info: ToolInfo, call: F) -> Result<Self, ConstructionError> {
        info.validate()?;
        Ok(Self {
            info,
            call,
            _args: PhantomData,
        })
    }
}

#[async_trait]
impl<A, F, Fut> Tool for FunctionTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, NodeError>> + Send + 'static,
{
    fn info(&self) -> &ToolInfo {
        &self.info
    }

    async fn invoke(&self, ctx: &CallContext, args: Value) -> Result<String, NodeError> {
        self.info.check_arguments(&args)?;
        let args = if args.is_null() { json!({}) } else { args };
        let parsed: A = serde_json::from_value(args).map_err(|err| {
            NodeError::invalid_input(format!("arguments of tool `{}`: {err}", self.info.name))
        })?;
        (self.call)(ctx.clone(), parsed).await
    }
}

/// Runs the tool calls carried by the last assistant message, in order, and answers each with
/// a tool message.
#[derive(Clone)]
pub struct ToolsNode {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolsNode {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Result<Self, ConstructionError> {
        let mut by_name = HashMap::with_capacity(tools.len());
        for (idx, tool) in tools.iter().enumerate() {
            let info = tool.info();
            info.validate()?;
            if by_name.insert(info.name.clone(), idx).is_some() {
                return Err(ConstructionError::DuplicateTool {
                    name: info.name.clone(),
                });
            }
        }
        Ok(Self { tools, by_name })
    }

    /// Schemas to bind to a model backend.
    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info().clone()).collect()
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }
}

#[async_trait]
impl Invoke for ToolsNode {
    async fn invoke(&self, ctx: &CallContext, input: Flow) -> Result<Payload, NodeError> {
        let messages = input.into_payload().await?.into_messages()?;
        let calls = match messages.last() {
            Some(last) if last.role == Role::Assistant && !last.tool_calls.is_empty() => {
                last.tool_calls.clone()
            }
            _ => {
                return Err(NodeError::invalid_input(
                    "last message is not an assistant message with tool calls",
                ));
            }
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(tool) = self.get(&call.name) else {
                return Err(NodeError::invalid_input(format!("unknown tool `{}`", call.name)));
            };
            debug!(
                event = "tool.invoked",
                domain = "tools",
                tool = %call.name,
                call_id = %call.id
            );
            let content = tool.invoke(ctx, call.arguments).await?;
            results.push(Message::tool(call.id, content));
        }
        Ok(Payload::messages(results))
    }
}

impl fmt::Debug for ToolsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tools.iter().map(|t| t.info().name.as_str()).collect();
        f.debug_struct("ToolsNode").field("tools", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCall;

    #[derive(Deserialize)]
    struct AddTodo {
        content: String,
        #[serde(default)]
        deadline: Option<i64>,
    }

    fn add_todo_info() -> ToolInfo {
        ToolInfo::new("add_todo", "Add a todo item")
            .param(
                ParameterInfo::new("content", ParamType::String)
                    .required()
                    .describe("The content of the todo item"),
            )
            .param(ParameterInfo::new("deadline", ParamType::Integer))
    }

    fn add_todo() -> Arc<dyn Tool> {
        Arc::new(
            FunctionTool::new(add_todo_info(), |_ctx, args: AddTodo| async move {
                Ok(format!(
                    "{{\"added\":\"{}\",\"deadline\":{}}}",
                    args.content,
                    args.deadline.unwrap_or(0)
                ))
            })
            .unwrap(),
        )
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    #[test]
    fn validate_rejects_bad_schemas() {
        assert!(add_todo_info().validate().is_ok());
        assert!(matches!(
            ToolInfo::new(" ", "x").validate(),
            Err(ConstructionError::InvalidSchema { .. })
        ));
        let twice = ToolInfo::new("t", "x")
            .param(ParameterInfo::new("a", ParamType::String))
            .param(ParameterInfo::new("a", ParamType::Integer));
        assert!(twice.validate().is_err());
        let unnamed = ToolInfo::new("t", "x").param(ParameterInfo::new("", ParamType::String));
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn check_arguments_enforces_required_and_types() {
        let info = add_todo_info();
        assert!(info.check_arguments(&json!({"content": "learn"})).is_ok());
        assert!(matches!(
            info.check_arguments(&json!({"deadline": 5})),
            Err(NodeError::InvalidInput(_))
        ));
        assert!(info.check_arguments(&json!({"content": 1})).is_err());
        assert!(info.check_arguments(&json!({"content": "x", "deadline": 1.5})).is_err());
        assert!(info.check_arguments(&json!("content")).is_err());
        assert!(ToolInfo::new("t", "x").check_arguments(&Value::Null).is_ok());
    }

    #[test]
    fn json_schema_lists_properties_and_required() {
        let schema = add_todo_info().to_json_schema();
        assert_eq!(schema["name"], "add_todo");
        assert_eq!(schema["parameters"]["properties"]["content"]["type"], "string");
        assert_eq!(
            schema["parameters"]["properties"]["content"]["description"],
            "The content of the todo item"
        );
        assert_eq!(
            schema["parameters"]["properties"]["deadline"],
            json!({"type": "integer"})
        );
        assert_eq!(schema["parameters"]["required"], json!(["content"]));
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let err = ToolsNode::new(vec![add_todo(), add_todo()]).unwrap_err();
        assert_eq!(
            err,
            ConstructionError::DuplicateTool {
                name: "add_todo".into()
            }
        );
    }

    #[tokio::test]
    async fn function_tool_parses_typed_arguments() {
        let out = add_todo()
            .invoke(&CallContext::new(), json!({"content": "learn", "deadline": 9}))
            .await
            .unwrap();
        assert_eq!(out, "{\"added\":\"learn\",\"deadline\":9}");
    }

    #[tokio::test]
    async fn tools_node_answers_each_call_in_order() {
        let node = ToolsNode::new(vec![add_todo()]).unwrap();
        let history = vec![
            Message::user("add two todos"),
            Message::assistant("").with_tool_calls(vec![
                call("c1", "add_todo", json!({"content": "a"})),
                call("c2", "add_todo", json!({"content": "b"})),
            ]),
        ];
        let out = node
            .invoke(&CallContext::new(), Flow::from(Payload::messages(history)))
            .await
            .unwrap();
        let Payload::Messages { items } = out else {
            panic!("expected messages");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(items[1].tool_call_id.as_deref(), Some("c2"));
        assert!(items.iter().all(|m| m.role == Role::Tool));
        assert!(items[1].content.contains("\"b\""));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_input() {
        let node = ToolsNode::new(vec![add_todo()]).unwrap();
        let history = vec![
            Message::assistant("").with_tool_calls(vec![call("c1", "search", json!({}))]),
        ];
        let err = node
            .invoke(&CallContext::new(), Flow::from(Payload::messages(history)))
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::invalid_input("unknown tool `search`"));
    }

    #[tokio::test]
    async fn missing_tool_calls_is_invalid_input() {
        let node = ToolsNode::new(vec![add_todo()]).unwrap();
        let err = node.invoke(&CallContext::new(), Flow::from("hi")).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidInput(_)));
    }
}
