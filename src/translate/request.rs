//! Family dispatch for request translation.
//!
//! `from_provider` decodes a raw JSON payload in a family's dialect into the
//! canonical request, field by field so a failure names the offending path.
//! `to_provider` goes the other way and never fails: unsupported constructs
//! are dropped and reported as warnings.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::canonical::{CanonicalRequest, Translated};
use super::upstream_types::{ProviderRequest, UpstreamRequest};
use super::{anthropic, google, openai};
use crate::error::{GatewayError, Result};
use crate::models::ModelFamily;

pub fn to_provider(req: &CanonicalRequest, family: ModelFamily) -> Translated<ProviderRequest> {
    let mut warnings = Vec::new();
    let value = match family {
        ModelFamily::OpenAi => ProviderRequest::OpenAi(openai::encode_request(req, &mut warnings)),
        ModelFamily::Anthropic => {
            ProviderRequest::Anthropic(anthropic::encode_request(req, &mut warnings))
        }
        ModelFamily::Google => ProviderRequest::Google(google::encode_request(req, &mut warnings)),
    };
    for w in &warnings {
        tracing::warn!(family = %family, warning = %w, "Lossy request translation");
    }
    Translated::new(value, warnings)
}

pub fn from_provider(payload: &Value, family: ModelFamily) -> Result<Translated<CanonicalRequest>> {
    let mut warnings = Vec::new();

    let mut req = match family {
        ModelFamily::OpenAi => openai::decode_request(decode_envelope(payload, family)?, family, &mut warnings)?,
        ModelFamily::Anthropic => anthropic::decode_request(decode_envelope(payload, family)?, &mut warnings)?,
        ModelFamily::Google => google::decode_request(decode_envelope(payload, family)?, &mut warnings)?,
    };

    req.timeout = optional_field(payload_object(payload, family)?, "timeout", family)?;
    dedupe_tools(&mut req, &mut warnings);

    Ok(Translated::new(req, warnings))
}

/// Tool names are unique per request. Later duplicates are dropped.
fn dedupe_tools(req: &mut CanonicalRequest, warnings: &mut Vec<String>) {
    let mut seen = HashSet::new();
    req.tools.retain(|tool| {
        let fresh = seen.insert(tool.name.clone());
        if !fresh {
            warnings.push(format!("dropped duplicate tool definition '{}'", tool.name));
        }
        fresh
    });
}

fn payload_object(payload: &Value, family: ModelFamily) -> Result<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| GatewayError::decode(family, "$", "request body must be a JSON object"))
}

fn decode_at<T: DeserializeOwned>(value: &Value, family: ModelFamily, path: &str) -> Result<T> {
    T::deserialize(value).map_err(|e| GatewayError::decode(family, path, e.to_string()))
}

fn optional_field<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    family: ModelFamily,
) -> Result<Option<T>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => decode_at(v, family, key).map(Some),
    }
}

fn optional_list<T: DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    family: ModelFamily,
) -> Result<Option<Vec<T>>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| decode_at(item, family, &format!("{key}[{i}]")))
            .collect::<Result<Vec<T>>>()
            .map(Some),
        Some(_) => Err(GatewayError::decode(family, key, "expected an array")),
    }
}

fn decode_envelope<M, T, C>(payload: &Value, family: ModelFamily) -> Result<UpstreamRequest<M, T, C>>
where
    M: DeserializeOwned,
    T: DeserializeOwned,
    C: DeserializeOwned,
{
    let obj = payload_object(payload, family)?;

    let model = match obj.get("model") {
        Some(Value::String(m)) => m.clone(),
        Some(_) => return Err(GatewayError::decode(family, "model", "expected a string")),
        None => return Err(GatewayError::decode(family, "model", "missing field")),
    };
    let messages = optional_list(obj, "messages", family)?
        .ok_or_else(|| GatewayError::decode(family, "messages", "missing field"))?;

    let stop = match obj.get("stop") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(v) => Some(decode_at::<Vec<String>>(v, family, "stop")?),
    };

    Ok(UpstreamRequest {
        user: optional_field(obj, "user", family)?,
        model,
        messages,
        tools: optional_list(obj, "tools", family)?,
        tool_choice: optional_field(obj, "tool_choice", family)?,
        stream: optional_field(obj, "stream", family)?,
        stop,
        temperature: optional_field(obj, "temperature", family)?,
        top_p: optional_field(obj, "top_p", family)?,
        max_tokens: optional_field(obj, "max_tokens", family)?,
        max_completion_tokens: optional_field(obj, "max_completion_tokens", family)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{
        ChatMessage, ContentPart, Role, ToolCall, ToolChoice, ToolDefinition,
    };
    use serde_json::json;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".to_string(),
            description: "Look up the weather".to_string(),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    /// A conversation every family can carry without loss.
    fn sample_request() -> CanonicalRequest {
        let mut req = CanonicalRequest::new(
            "model-x",
            vec![
                ChatMessage::text(Role::System, "You are terse."),
                ChatMessage::text(Role::User, "Weather in Paris?"),
                ChatMessage::new(
                    Role::Assistant,
                    vec![
                        ContentPart::text("Checking."),
                        ContentPart::ToolUse(ToolCall::new(
                            "toolu_1",
                            "get_weather",
                            args(json!({"city": "Paris"})),
                        )),
                    ],
                ),
                ChatMessage::new(
                    Role::Tool,
                    vec![ContentPart::ToolResult {
                        tool_use_id: "toolu_1".to_string(),
                        content: "sunny".to_string(),
                    }],
                ),
                ChatMessage::text(Role::User, "Thanks"),
            ],
        );
        req.tools = vec![weather_tool()];
        req.tool_choice = Some(ToolChoice::Specific("get_weather".to_string()));
        req.params.temperature = Some(0.2);
        req.params.max_tokens = Some(256);
        req.user = Some("alice".to_string());
        req
    }

    fn round_trip(req: &CanonicalRequest, family: ModelFamily) -> CanonicalRequest {
        let encoded = to_provider(req, family);
        assert!(encoded.warnings.is_empty(), "{:?}", encoded.warnings);
        let payload = serde_json::to_value(&encoded.value).unwrap();
        from_provider(&payload, family).unwrap().value
    }

    /// Tool-message names are only carried by the OpenAI-shaped dialects.
    fn without_names(mut req: CanonicalRequest) -> CanonicalRequest {
        for m in &mut req.messages {
            m.name = None;
        }
        req
    }

    #[test]
    fn test_round_trip_openai() {
        let req = sample_request();
        assert_eq!(round_trip(&req, ModelFamily::OpenAi), req);
    }

    #[test]
    fn test_round_trip_anthropic() {
        let req = sample_request();
        assert_eq!(round_trip(&req, ModelFamily::Anthropic), req);
    }

    #[test]
    fn test_round_trip_google() {
        let req = sample_request();
        // Google fills in the function name on tool results.
        assert_eq!(without_names(round_trip(&req, ModelFamily::Google)), req);
    }

    #[test]
    fn test_round_trip_each_tool_choice() {
        for choice in [ToolChoice::Auto, ToolChoice::None, ToolChoice::Required] {
            for family in [ModelFamily::OpenAi, ModelFamily::Anthropic, ModelFamily::Google] {
                let mut req = sample_request();
                req.tool_choice = Some(choice.clone());
                assert_eq!(
                    without_names(round_trip(&req, family)).tool_choice,
                    Some(choice.clone()),
                    "{family}"
                );
            }
        }
    }

    #[test]
    fn test_openai_arguments_string_becomes_anthropic_object() {
        let payload = json!({
            "model": "claudesonnet4",
            "messages": [
                {"role": "user", "content": "add"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "add", "arguments": "{\"a\":1}"}
                }]}
            ]
        });
        let canonical = from_provider(&payload, ModelFamily::OpenAi).unwrap().value;
        let anthropic = to_provider(&canonical, ModelFamily::Anthropic).value;
        let wire = serde_json::to_value(&anthropic).unwrap();

        let block = &wire["messages"][1]["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["input"], json!({"a": 1}));
        assert!(block["input"].is_object());
    }

    #[test]
    fn test_shorthand_tool_choice_on_every_family() {
        for family in [ModelFamily::OpenAi, ModelFamily::Anthropic, ModelFamily::Google] {
            let payload = json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "tool_choice": "any"
            });
            let req = from_provider(&payload, family).unwrap().value;
            assert_eq!(req.tool_choice, Some(ToolChoice::Required), "{family}");
        }
    }

    #[test]
    fn test_anthropic_tool_choice_maps_to_openai_required() {
        let payload = json!({
            "model": "claudesonnet4",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": {"type": "any"}
        });
        let req = from_provider(&payload, ModelFamily::Anthropic).unwrap().value;
        let wire = serde_json::to_value(to_provider(&req, ModelFamily::OpenAi).value).unwrap();
        assert_eq!(wire["tool_choice"], "required");
    }

    #[test]
    fn test_decode_error_names_path() {
        let payload = json!({
            "model": "gpt4o",
            "messages": [
                {"role": "user", "content": "ok"},
                {"role": "user", "content": 42}
            ]
        });
        match from_provider(&payload, ModelFamily::OpenAi) {
            Err(GatewayError::Decode { family, path, .. }) => {
                assert_eq!(family, ModelFamily::OpenAi);
                assert_eq!(path, "messages[1]");
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_model_is_decode_error() {
        let payload = json!({"messages": []});
        let err = from_provider(&payload, ModelFamily::Google).unwrap_err();
        assert!(matches!(err, GatewayError::Decode { ref path, .. } if path == "model"));
    }

    #[test]
    fn test_duplicate_tools_dropped_with_warning() {
        let payload = json!({
            "model": "gpt4o",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"type": "function", "function": {"name": "a", "parameters": {}}},
                {"type": "function", "function": {"name": "a", "description": "again", "parameters": {}}}
            ]
        });
        let translated = from_provider(&payload, ModelFamily::OpenAi).unwrap();
        assert_eq!(translated.value.tools.len(), 1);
        assert_eq!(translated.value.tools[0].description, "");
        assert_eq!(translated.warnings.len(), 1);
    }

    #[test]
    fn test_timeout_and_stop_string() {
        let payload = json!({
            "model": "gpt4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END",
            "timeout": 2.5
        });
        let req = from_provider(&payload, ModelFamily::OpenAi).unwrap().value;
        assert_eq!(req.timeout, Some(2.5));
        assert_eq!(req.params.stop, Some(vec!["END".to_string()]));
    }
}
