//! Offline tool-calling agent: a scripted planner picks tools, the tools node runs them, and a
//! scripted answer model streams a reply built from the tool results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hookline_core::chat::{ChatModel, Message, Role, ToolCall};
use hookline_core::tool::{FunctionTool, ParamType, ParameterInfo, Tool, ToolInfo, ToolsNode};
use hookline_core::{
    CallContext, ConstructionError, Frame, HookRegistration, NodeError, NodeSpec, Payload,
    Pipeline, Shape, StreamReader,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Deserialize)]
struct WeatherArgs {
    city: String,
}

#[derive(Debug, Deserialize)]
struct AddTodoArgs {
    content: String,
    #[serde(default)]
    deadline: Option<i64>,
}

fn weather_tool() -> Result<Arc<dyn Tool>, ConstructionError> {
    let info = ToolInfo::new("get_weather", "Current weather for a city").param(
        ParameterInfo::new("city", ParamType::String)
            .required()
            .describe("City name"),
    );
    let tool = FunctionTool::new(info, |_ctx, args: WeatherArgs| async move {
        Ok(json!({ "city": args.city, "condition": "sunny", "temperature_c": 24 }).to_string())
    })?;
    Ok(Arc::new(tool))
}

fn add_todo_tool() -> Result<Arc<dyn Tool>, ConstructionError> {
    let info = ToolInfo::new("add_todo", "Add a todo item")
        .param(
            ParameterInfo::new("content", ParamType::String)
                .required()
                .describe("The content of the todo item"),
        )
        .param(
            ParameterInfo::new("deadline", ParamType::Integer)
                .describe("The deadline of the todo item, in unix timestamp"),
        );
    let tool = FunctionTool::new(info, |_ctx, args: AddTodoArgs| async move {
        Ok(json!({ "msg": "add todo success", "content": args.content, "deadline": args.deadline })
            .to_string())
    })?;
    Ok(Arc::new(tool))
}

/// Chooses among the bound tools by matching words of each tool name against the latest
/// user message. Tool names are read back from the JSON schemas a real backend would send.
#[derive(Default)]
struct ScriptedPlanner {
    schemas: Vec<Value>,
}

impl ScriptedPlanner {
    fn plan(&self, question: &str) -> Vec<ToolCall> {
        let lower = question.to_lowercase();
        let mut chosen: Vec<&Value> = self
            .schemas
            .iter()
            .filter(|schema| {
                schema["name"]
                    .as_str()
                    .unwrap_or_default()
                    .split('_')
                    .filter(|word| word.len() > 3)
                    .any(|word| lower.contains(word))
            })
            .collect();
        // Nothing matched: the last bound tool takes the whole question.
        if chosen.is_empty() {
            chosen.extend(self.schemas.last());
        }
        chosen
            .into_iter()
            .enumerate()
            .map(|(idx, schema)| ToolCall {
                id: format!("call_{}", idx + 1),
                name: schema["name"].as_str().unwrap_or_default().to_string(),
                arguments: arguments_for(schema, question),
            })
            .collect()
    }
}

/// Fill every required string parameter: places from the question, anything else with the
/// question itself.
fn arguments_for(schema: &Value, question: &str) -> Value {
    let properties = &schema["parameters"]["properties"];
    let args: Map<String, Value> = schema["parameters"]["required"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|name| properties[*name]["type"] == "string")
        .map(|name| {
            let value = match name {
                "city" | "location" => city_in(question).unwrap_or("Beijing"),
                _ => question,
            };
            (name.to_string(), json!(value))
        })
        .collect();
    Value::Object(args)
}

/// Word following "in", with trailing punctuation removed.
fn city_in(question: &str) -> Option<&str> {
    let mut words = question.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("in") {
            return words
                .next()
                .map(|w| w.trim_end_matches(|c: char| !c.is_alphanumeric()))
                .filter(|w| !w.is_empty());
        }
    }
    None
}

#[async_trait]
impl ChatModel for ScriptedPlanner {
    async fn generate(&self, _ctx: &CallContext, messages: &[Message]) -> Result<Message, NodeError> {
        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| NodeError::invalid_input("no user message to plan from"))?;
        Ok(Message::assistant("").with_tool_calls(self.plan(&question.content)))
    }

    fn bind_tools(&mut self, tools: &[ToolInfo]) -> Result<(), ConstructionError> {
        for tool in tools {
            tool.validate()?;
        }
        self.schemas = tools.iter().map(ToolInfo::to_json_schema).collect();
        Ok(())
    }
}

/// Streams a summary of tool results as assistant deltas, one word per frame.
struct ScriptedAnswer {
    delay: Duration,
}

impl ScriptedAnswer {
    fn compose(messages: &[Message]) -> String {
        let results: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        if results.is_empty() {
            "I could not find anything to report.".to_string()
        } else {
            format!("Here is what the tools returned: {}", results.join(" and "))
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedAnswer {
    async fn generate(&self, _ctx: &CallContext, messages: &[Message]) -> Result<Message, NodeError> {
        Ok(Message::assistant(Self::compose(messages)))
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        messages: &[Message],
    ) -> Result<StreamReader<Frame>, NodeError> {
        let answer = Self::compose(messages);
        let delay = self.delay;
        let (tx, rx) = ctx.pipe::<Frame>();
        tokio::spawn(async move {
            let deltas: Vec<String> = answer
                .split_inclusive(' ')
                .map(String::from)
                .collect();
            for (idx, delta) in deltas.into_iter().enumerate() {
                let frame = Frame::new(Payload::messages(vec![Message::assistant(delta)]))
                    .with_index(idx as u64);
                if tx.send(frame).is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        });
        Ok(rx)
    }
}

/// planner (scalar chat model) -> tools -> answer (streaming chat model).
pub fn agent_pipeline(
    hooks: Vec<HookRegistration>,
    delay: Duration,
) -> Result<Pipeline, ConstructionError> {
    let tools = ToolsNode::new(vec![weather_tool()?, add_todo_tool()?])?;
    hooks
        .into_iter()
        .fold(Pipeline::builder("agent"), |b, h| b.hook(h))
        .node(NodeSpec::chat_model_with_tools(
            "planner",
            ScriptedPlanner::default(),
            &tools,
            Shape::Scalar,
        )?)
        .node(NodeSpec::tools("tools", tools))
        .node(NodeSpec::chat_model(
            "answer",
            Arc::new(ScriptedAnswer { delay }),
            Shape::Stream,
        ))
        .compile()
}
