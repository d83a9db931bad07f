use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Debug,
    Fail,
    Success,
    Unsupport,
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Debug => "debug",
            EventKind::Fail => "fail",
            EventKind::Success => "success",
            EventKind::Unsupport => "unsupport",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification, serialized on the push stream as
/// `{"event": <kind>, "body": {...}}`.
///
/// Body values are flat primitives. Builders never accept an activation code,
/// only its length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    kind: EventKind,
    body: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            body: BTreeMap::new(),
        }
    }

    pub fn stage(kind: EventKind, stage: &str) -> Self {
        Self::new(kind).with("stage", stage)
    }

    pub fn status(stage: &str) -> Self {
        Self::stage(EventKind::Status, stage)
    }

    pub fn debug(stage: &str) -> Self {
        Self::stage(EventKind::Debug, stage)
    }

    pub fn fail(stage: &str) -> Self {
        Self::stage(EventKind::Fail, stage)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        debug_assert!(
            !matches!(value, Value::Array(_) | Value::Object(_)),
            "event body values must be primitives"
        );
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn body(&self) -> &BTreeMap<String, Value> {
        &self.body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn stage_name(&self) -> Option<&str> {
        self.body.get("stage").and_then(Value::as_str)
    }

    pub fn to_message(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
