//! Upstream responses in, OpenAI chat completions out.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::anthropic_types::ResponseContentBlock;
use super::canonical::{CanonicalResponse, FinishReason, ToolCall, UsageRecord};
use super::google;
use super::google_types::FunctionCall;
use super::openai::{encode_tool_call, object_or_empty, parse_arguments};
use super::openai_types::{ChatCompletionResponse, ChatToolCall, ChatUsage, Choice, ChoiceMessage};
use super::upstream_types::{UpstreamContent, UpstreamPayload, UpstreamResponse};
use crate::error::{GatewayError, Result};
use crate::models::ModelFamily;

/// Decode a non-streaming upstream body for `family`.
///
/// The structured channel (`tool_calls`, plus any `tool_use` content blocks)
/// is decoded here. Leak recovery on the text happens later.
pub fn response_from_provider(
    body: &Value,
    family: ModelFamily,
    warnings: &mut Vec<String>,
) -> Result<CanonicalResponse> {
    let envelope = decode_envelope(body, family)?;

    let (content, raw_calls) = match envelope.response {
        UpstreamPayload::Text(text) => return Ok(CanonicalResponse { text, tool_calls: Vec::new() }),
        UpstreamPayload::Structured {
            content,
            tool_calls,
        } => (content, tool_calls.map(|t| t.into_vec()).unwrap_or_default()),
    };

    let mut tool_calls = decode_tool_calls(raw_calls, family, warnings)?;

    let text = match content {
        None => String::new(),
        Some(UpstreamContent::Text(t)) => t,
        Some(UpstreamContent::Blocks(blocks)) => {
            let mut text = String::new();
            for (i, block) in blocks.iter().enumerate() {
                let path = format!("response.content[{i}]");
                match decode_at::<ResponseContentBlock>(block, family, &path)? {
                    ResponseContentBlock::Text { text: t } => text.push_str(&t),
                    ResponseContentBlock::ToolUse { id, name, input } => {
                        let (arguments, warning) = object_or_empty(input);
                        if let Some(w) = warning {
                            warnings.push(format!("{path}: {w}"));
                        }
                        tool_calls.push(ToolCall::new(id, name, arguments));
                    }
                    ResponseContentBlock::Unknown => {
                        warnings.push(format!("{path}: skipped unsupported block"));
                    }
                }
            }
            text
        }
    };

    Ok(CanonicalResponse { text, tool_calls })
}

fn decode_envelope(body: &Value, family: ModelFamily) -> Result<UpstreamResponse> {
    if body.get("response").is_none() {
        return Err(GatewayError::decode(family, "response", "missing field"));
    }
    decode_at(body, family, "response")
}

fn decode_tool_calls(
    raw: Vec<Value>,
    family: ModelFamily,
    warnings: &mut Vec<String>,
) -> Result<Vec<ToolCall>> {
    match family {
        ModelFamily::OpenAi => raw
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let call: ChatToolCall = decode_at(v, family, &format!("response.tool_calls[{i}]"))?;
                let (arguments, warning) = parse_arguments(&call.function.arguments);
                if let Some(w) = warning {
                    warnings.push(format!("response.tool_calls[{i}]: {w}"));
                }
                Ok(ToolCall::new(call.id, call.function.name, arguments))
            })
            .collect(),
        ModelFamily::Anthropic => raw
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let path = format!("response.tool_calls[{i}]");
                let mut v = v.clone();
                // The structured channel sometimes omits the block tag.
                if let Value::Object(obj) = &mut v {
                    obj.entry("type").or_insert_with(|| Value::from("tool_use"));
                }
                match decode_at::<ResponseContentBlock>(&v, family, &path)? {
                    ResponseContentBlock::ToolUse { id, name, input } => {
                        let (arguments, warning) = object_or_empty(input);
                        if let Some(w) = warning {
                            warnings.push(format!("{path}: {w}"));
                        }
                        Ok(ToolCall::new(id, name, arguments))
                    }
                    _ => Err(GatewayError::decode(family, path, "expected a tool_use block")),
                }
            })
            .collect(),
        ModelFamily::Google => {
            let calls = raw
                .iter()
                .enumerate()
                .map(|(i, v)| decode_at::<FunctionCall>(v, family, &format!("response.tool_calls[{i}]")))
                .collect::<Result<Vec<_>>>()?;
            Ok(google::decode_function_calls(calls, warnings))
        }
    }
}

fn decode_at<T: DeserializeOwned>(value: &Value, family: ModelFamily, path: &str) -> Result<T> {
    T::deserialize(value).map_err(|e| GatewayError::decode(family, path, e.to_string()))
}

/// Build the client-facing completion for a fully post-processed response.
pub fn to_chat_completion(
    id: &str,
    created: i64,
    model: &str,
    text: &str,
    tool_calls: &[ToolCall],
    usage: UsageRecord,
) -> ChatCompletionResponse {
    let finish = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };

    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty() || tool_calls.is_empty()).then(|| text.to_string()),
                tool_calls: (!tool_calls.is_empty())
                    .then(|| tool_calls.iter().map(encode_tool_call).collect()),
            },
            finish_reason: Some(finish.as_str().to_string()),
        }],
        usage: Some(usage_to_wire(usage)),
    }
}

pub fn usage_to_wire(usage: UsageRecord) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_response() {
        let body = json!({"response": "Hello!"});
        let resp = response_from_provider(&body, ModelFamily::OpenAi, &mut Vec::new()).unwrap();
        assert_eq!(resp.text, "Hello!");
        assert!(resp.tool_calls.is_empty());
    }

    #[test]
    fn test_openai_structured_response() {
        let body = json!({"response": {
            "content": null,
            "tool_calls": [{
                "id": "call_abc", "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"London\"}"}
            }]
        }});
        let resp = response_from_provider(&body, ModelFamily::OpenAi, &mut Vec::new()).unwrap();
        assert_eq!(resp.text, "");
        assert_eq!(resp.tool_calls[0].id, "call_abc");
        assert_eq!(resp.tool_calls[0].arguments["city"], "London");
    }

    #[test]
    fn test_google_single_object_tool_call() {
        let body = json!({"response": {
            "content": "",
            "tool_calls": {"id": null, "args": {"a": 2, "b": 3}, "name": "add"}
        }});
        let resp = response_from_provider(&body, ModelFamily::Google, &mut Vec::new()).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "call_0");
        assert_eq!(resp.tool_calls[0].arguments["b"], 3);
    }

    #[test]
    fn test_anthropic_tool_calls_and_blocks() {
        let body = json!({"response": {
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_2", "name": "search", "input": {"q": "rust"}}
            ],
            "tool_calls": [{"id": "toolu_1", "name": "bash", "input": {"cmd": "ls"}}]
        }});
        let resp = response_from_provider(&body, ModelFamily::Anthropic, &mut Vec::new()).unwrap();
        assert_eq!(resp.text, "Let me check.");
        let ids: Vec<&str> = resp.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["toolu_1", "toolu_2"]);
    }

    #[test]
    fn test_missing_envelope_is_decode_error() {
        let body = json!({"choices": []});
        let err = response_from_provider(&body, ModelFamily::OpenAi, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Decode { ref path, .. } if path == "response"));
    }

    #[test]
    fn test_bad_tool_call_names_index() {
        let body = json!({"response": {"content": "x", "tool_calls": [{"nope": true}]}});
        let err = response_from_provider(&body, ModelFamily::Google, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Decode { ref path, .. } if path == "response.tool_calls[0]"));
    }

    #[test]
    fn test_chat_completion_finish_reason() {
        let call = ToolCall::new("call_1", "f", serde_json::Map::new());
        let resp = to_chat_completion("chatcmpl-1", 0, "gpt4o", "", &[call], UsageRecord::new(5, 6));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert!(resp.choices[0].message.content.is_none());
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 11);

        let resp = to_chat_completion("chatcmpl-2", 0, "gpt4o", "hi", &[], UsageRecord::default());
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hi"));
    }
}
