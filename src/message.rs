// src/message.rs
//! Invocation payloads fanned out to connections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A hub method invocation: the client-side method to call and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_arguments_default_to_empty() {
        let msg: InvocationMessage = serde_json::from_str(r#"{"target":"ping"}"#).unwrap();
        assert_eq!(msg, InvocationMessage::new("ping", vec![]));
    }

    #[test]
    fn arguments_keep_their_json_shape() {
        let msg = InvocationMessage::new("say", vec![json!("hi"), json!({"n": 1})]);
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["arguments"][1]["n"], 1);
    }
}
