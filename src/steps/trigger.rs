//! Trigger step: normalizes external payloads into one shape per `kind`.
//!
//! Chat payloads become `{kind, current_message, messages, attachments,
//! dropped_messages}`; every other kind becomes `{kind, data}`.

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Map, Value};

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::execution::registry::{StepExecutor, StepOutput};
use crate::workflow::model::StepConfig;

const DEFAULT_KIND: &str = "webhook";

#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerStep;

#[async_trait]
impl StepExecutor for TriggerStep {
    async fn execute(
        &self,
        step: &StepConfig,
        _input: &StepOutput,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let payload = match context
            .staged_data(&step.step_id)
            .or_else(|| context.trigger_raw())
        {
            Some(Value::Object(fields)) => fields.clone(),
            _ => Map::new(),
        };

        let strict = step.parameter_bool("strict_messages", false);
        normalize(&step.step_id, &payload, strict)
    }
}

/// Normalizes a raw trigger payload.
pub fn normalize(step_id: &str, payload: &Map<String, Value>, strict: bool) -> Result<StepOutput, StepError> {
    let fields = Fields {
        payload,
        nested: payload.get("trigger").and_then(Value::as_object),
    };

    let kind = fields
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_KIND)
        .to_string();

    if kind == "chat" {
        return normalize_chat(step_id, &fields, strict);
    }

    let data = match fields.get("data") {
        Some(data) => data.clone(),
        None => {
            let mut rest = payload.clone();
            rest.remove("kind");
            rest.remove("trigger");
            Value::Object(rest)
        }
    };

    let mut output = StepOutput::new();
    output.insert("kind".into(), Value::String(kind));
    output.insert("data".into(), data);
    Ok(output)
}

/// Payload fields, looked up in a nested `trigger` object first.
struct Fields<'a> {
    payload: &'a Map<String, Value>,
    nested: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.nested
            .and_then(|trigger| trigger.get(key))
            .or_else(|| self.payload.get(key))
            .filter(|value| !value.is_null())
    }
}

fn normalize_chat(step_id: &str, fields: &Fields<'_>, strict: bool) -> Result<StepOutput, StepError> {
    let current_message = fields
        .get("current_message")
        .and_then(Value::as_str)
        .map(str::to_string);
    let need_history = fields
        .get("need_history")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut messages = Vec::new();
    let mut dropped = 0usize;

    if let Some(Value::Array(prebuilt)) = fields.get("messages") {
        for entry in prebuilt {
            match chat_message(entry) {
                Some(message) => messages.push(message),
                None => dropped += 1,
            }
        }
    } else {
        if need_history {
            if let Some(Value::Array(history)) = fields.get("history") {
                for entry in history {
                    match chat_message(entry) {
                        Some(message) => messages.push(message),
                        None => dropped += 1,
                    }
                }
            }
        }
        if let Some(text) = &current_message {
            messages.push(json!({"role": "user", "content": text}));
        }
    }

    if dropped > 0 {
        if strict {
            return Err(StepError::InvalidInput(format!(
                "{} malformed chat message(s) in trigger payload",
                dropped
            )));
        }
        warn!(
            "Trigger '{}' dropped {} malformed chat message(s)",
            step_id, dropped
        );
    }

    let attachments = match fields.get("attachments") {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => Value::Array(Vec::new()),
    };

    let mut output = StepOutput::new();
    output.insert("kind".into(), json!("chat"));
    output.insert(
        "current_message".into(),
        current_message.map(Value::String).unwrap_or(Value::Null),
    );
    output.insert("messages".into(), Value::Array(messages));
    output.insert("attachments".into(), attachments);
    output.insert("dropped_messages".into(), json!(dropped));
    Ok(output)
}

/// Returns `{role, content}` if the entry is a well-formed message.
fn chat_message(entry: &Value) -> Option<Value> {
    let object = entry.as_object()?;
    let role = object.get("role")?.as_str()?;
    let content = object.get("content")?.as_str()?;
    Some(json!({"role": role, "content": content}))
}
