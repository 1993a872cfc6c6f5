//! Data model: what flows from an inbound message to a handler invocation.
//!
//! ```text
//! (topic, Payload) ──decode──▶ TransformData ──resolve──▶ Job* ──worker──▶ WorkItem ──▶ Handler
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Map, Value};

/// The evolving key/value map derived from a message.
pub type TransformData = Map<String, Value>;

/// Raw message payload as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Valid UTF-8.
    Text(String),
    /// Anything that failed UTF-8 decoding, kept verbatim.
    Binary(Vec<u8>),
}

impl Payload {
    /// Decode bytes as UTF-8, keeping the raw bytes when that fails.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Payload::Text(text),
            Err(e) => Payload::Binary(e.into_bytes()),
        }
    }

    /// Text view of the payload (lossy for binary payloads).
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(s) => Cow::Borrowed(s.as_str()),
            Payload::Binary(b) => String::from_utf8_lossy(b),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Binary(b) => b,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Representation stored under the `payload` key of the transform data.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::from_bytes(bytes)
    }
}

/// Extract `name` from a function reference of the form `name()`.
pub fn function_ref(reference: &str) -> Option<&str> {
    let name = reference.trim().strip_suffix("()")?;
    if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}

/// How a routing rule names its targets.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    /// `targets = "name()"`: computed per message.
    Function(String),
    /// `targets = { "pattern" = targets }`: most specific matching pattern wins.
    Dispatch(Vec<(String, Vec<Value>)>),
    /// `targets = ["log:info", ...]` or `"log:info, file"`.
    List(Vec<Value>),
    /// Anything else; resolution aborts for every message.
    Invalid(Value),
}

impl TargetSpec {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => match function_ref(s) {
                Some(name) => TargetSpec::Function(name.to_string()),
                None => TargetSpec::List(
                    s.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(|t| Value::String(t.to_string()))
                        .collect(),
                ),
            },
            Value::Array(items) => TargetSpec::List(items.clone()),
            Value::Object(map) => TargetSpec::Dispatch(
                map.iter()
                    .map(|(pattern, targets)| {
                        let targets = match targets {
                            Value::Array(items) => items.clone(),
                            other => vec![other.clone()],
                        };
                        (pattern.clone(), targets)
                    })
                    .collect(),
            ),
            other => TargetSpec::Invalid(other.clone()),
        }
    }
}

/// One configured routing rule ("section").
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    /// Bus wildcard pattern; defaults to the rule name.
    pub topic: String,
    pub qos: u8,
    pub targets: TargetSpec,
    pub filter: Option<String>,
    pub datamap: Option<String>,
    pub alldata: Option<String>,
    pub title: Option<String>,
    pub image: Option<String>,
    pub format: Option<String>,
    pub template: Option<String>,
    pub priority: Option<String>,
}

impl RoutingRule {
    /// A rule matching its own name, routing to a fixed list.
    pub fn new(name: &str, targets: TargetSpec) -> Self {
        Self {
            name: name.to_string(),
            topic: name.to_string(),
            qos: 0,
            targets,
            filter: None,
            datamap: None,
            alldata: None,
            title: None,
            image: None,
            format: None,
            template: None,
            priority: None,
        }
    }
}

/// A unit of work: deliver one message to one handler target.
#[derive(Debug, Clone)]
pub struct Job {
    pub priority: i64,
    pub handler_name: String,
    pub rule_name: String,
    pub topic: String,
    pub payload: Payload,
    /// Shared by every job fanned out from the same message.
    pub data: Arc<TransformData>,
    /// `None` addresses every target of the handler.
    pub target_name: Option<String>,
}

/// Fully resolved structure handed to a handler at invocation time.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub handler: String,
    pub rule: String,
    pub target: String,
    /// Handler configuration map.
    pub config: Map<String, Value>,
    /// Target address descriptor, shape owned by the handler.
    pub addrs: Value,
    pub topic: String,
    pub payload: Payload,
    pub data: TransformData,
    pub title: String,
    pub image: String,
    pub message: String,
    pub priority: i64,
}

/// A message the core asks the transport to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}
