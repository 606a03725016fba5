//! Values passed between nodes and the frames a stream is made of.

use serde::{Deserialize, Serialize};

use crate::chat::{Message, concat_messages};
use crate::errors::NodeError;

/// Typed value produced or consumed by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "v", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text {
        value: String,
    },
    Json {
        value: serde_json::Value,
    },
    Messages {
        items: Vec<Message>,
    },
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text {
            value: value.into(),
        }
    }

    pub fn messages(items: Vec<Message>) -> Self {
        Payload::Messages { items }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Text { .. } => "text",
            Payload::Json { .. } => "json",
            Payload::Messages { .. } => "messages",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text { value } => Some(value),
            _ => None,
        }
    }

    /// Conversation view of the payload: text becomes a single user message.
    pub fn into_messages(self) -> Result<Vec<Message>, NodeError> {
        match self {
            Payload::Empty => Ok(Vec::new()),
            Payload::Text { value } => Ok(vec![Message::user(value)]),
            Payload::Messages { items } => Ok(items),
            Payload::Json { .. } => Err(NodeError::invalid_input(
                "json payload cannot be read as messages",
            )),
        }
    }

    /// Merge the payloads of consecutive frames into one value.
    ///
    /// Text is concatenated, JSON values are gathered into an array, and message
    /// deltas sharing a role are merged into a single message. Empty chunks are
    /// skipped; mixing kinds is an error.
    pub fn concat(chunks: impl IntoIterator<Item = Payload>) -> Result<Payload, NodeError> {
        let mut chunks = chunks
            .into_iter()
            .filter(|c| !matches!(c, Payload::Empty))
            .peekable();
        let Some(first_kind) = chunks.peek().map(Payload::kind) else {
            return Ok(Payload::Empty);
        };
        match first_kind {
            "text" => {
                let mut out = String::new();
                for chunk in chunks {
                    match chunk {
                        Payload::Text { value } => out.push_str(&value),
                        other => return Err(mixed_kinds(first_kind, other.kind())),
                    }
                }
                Ok(Payload::Text { value: out })
            }
            "json" => {
                let mut values = Vec::new();
                for chunk in chunks {
                    match chunk {
                        Payload::Json { value } => values.push(value),
                        other => return Err(mixed_kinds(first_kind, other.kind())),
                    }
                }
                if values.len() == 1 {
                    return Ok(Payload::Json {
                        value: values.remove(0),
                    });
                }
                Ok(Payload::Json {
                    value: serde_json::Value::Array(values),
                })
            }
            _ => {
                let mut items = Vec::new();
                for chunk in chunks {
                    match chunk {
                        Payload::Messages { items: part } => items.extend(part),
                        other => return Err(mixed_kinds(first_kind, other.kind())),
                    }
                }
                let same_role = items.windows(2).all(|w| w[0].role == w[1].role);
                if same_role && !items.is_empty() {
                    return Ok(Payload::Messages {
                        items: vec![concat_messages(items)?],
                    });
                }
                Ok(Payload::Messages { items })
            }
        }
    }
}

fn mixed_kinds(expected: &str, actual: &str) -> NodeError {
    NodeError::invalid_input(format!(
        "cannot concatenate {actual} chunk into a {expected} stream"
    ))
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::text(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text { value }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json { value }
    }
}

impl From<Vec<Message>> for Payload {
    fn from(items: Vec<Message>) -> Self {
        Payload::Messages { items }
    }
}

impl From<Payload> for Option<String> {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Empty => None,
            Payload::Text { value } => Some(value),
            Payload::Json { value } => value
                .as_str()
                .map(String::from)
                .or_else(|| Some(value.to_string())),
            Payload::Messages { items } => items.last().map(|m| m.content.clone()),
        }
    }
}

/// One chunk of streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub payload: Payload,
    /// Optional position of the chunk in the producer's sequence (e.g. a token index).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl Frame {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            index: None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(Payload::text(value))
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        self.payload.as_text()
    }
}

/// Concatenate a drained stream of frames, see [`Payload::concat`].
pub fn concat_frames(frames: Vec<Frame>) -> Result<Payload, NodeError> {
    Payload::concat(frames.into_iter().map(|f| f.payload))
}
