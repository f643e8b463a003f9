//! Canonical ⇄ OpenAI chat-completions dialect.
//!
//! The OpenAI shape is also what clients send and what the upstream's Google
//! dialect uses for history, so the message codecs here are shared.

use serde_json::{Map, Value};

use super::canonical::{
    CanonicalRequest, ChatMessage, ContentPart, Role, ToolCall, ToolChoice, ToolDefinition,
};
use super::openai_types::{
    ChatContent, ChatFunction, ChatMessage as WireMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart as WirePart, ImageUrlDetail,
};
use super::upstream_types::OpenAiRequest;
use crate::error::{GatewayError, Result};
use crate::images::parse_data_url;
use crate::models::ModelFamily;

// ---------------------------------------------------------------------------
// Encoding (canonical -> wire)
// ---------------------------------------------------------------------------

pub fn encode_request(req: &CanonicalRequest, warnings: &mut Vec<String>) -> OpenAiRequest {
    OpenAiRequest {
        user: req.user.clone(),
        model: req.model.clone(),
        messages: encode_messages(&req.messages, warnings),
        tools: (!req.tools.is_empty()).then(|| req.tools.iter().map(encode_tool).collect()),
        tool_choice: req.tool_choice.as_ref().map(encode_tool_choice),
        stream: Some(req.stream),
        stop: req.params.stop.clone(),
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        max_tokens: req.params.max_tokens,
        max_completion_tokens: req.params.max_completion_tokens,
    }
}

pub fn encode_messages(messages: &[ChatMessage], warnings: &mut Vec<String>) -> Vec<WireMessage> {
    messages
        .iter()
        .filter_map(|m| encode_message(m, warnings))
        .collect()
}

fn encode_message(msg: &ChatMessage, warnings: &mut Vec<String>) -> Option<WireMessage> {
    match msg.role {
        Role::System | Role::User => {
            let mut parts = Vec::new();
            for part in &msg.content {
                match part {
                    ContentPart::Text { text } => parts.push(WirePart::Text { text: text.clone() }),
                    ContentPart::Image { url, .. } => parts.push(WirePart::ImageUrl {
                        image_url: ImageUrlDetail {
                            url: url.clone(),
                            detail: None,
                        },
                    }),
                    ContentPart::ToolUse(_) | ContentPart::ToolResult { .. } => warnings.push(format!(
                        "dropped tool content inside a {} message",
                        msg.role.as_str()
                    )),
                }
            }
            Some(WireMessage::new(msg.role.as_str(), Some(collapse_parts(parts))))
        }
        Role::Assistant => {
            let text = msg.joined_text();
            let tool_calls: Vec<ChatToolCall> = msg.tool_calls().map(encode_tool_call).collect();
            let mut out = WireMessage::new(
                "assistant",
                (!text.is_empty() || tool_calls.is_empty()).then_some(ChatContent::Text(text)),
            );
            out.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
            Some(out)
        }
        Role::Tool => {
            let result = msg.content.iter().find_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                } => Some((tool_use_id, content)),
                _ => None,
            });
            let Some((tool_use_id, content)) = result else {
                warnings.push("dropped tool message without a tool result".to_string());
                return None;
            };
            let mut out = WireMessage::new("tool", Some(ChatContent::Text(content.clone())));
            out.tool_call_id = Some(tool_use_id.clone());
            out.name = msg.name.clone();
            Some(out)
        }
    }
}

fn collapse_parts(parts: Vec<WirePart>) -> ChatContent {
    if parts.len() == 1 {
        if let WirePart::Text { text } = &parts[0] {
            return ChatContent::Text(text.clone());
        }
    }
    ChatContent::Parts(parts)
}

pub fn encode_tool_call(call: &ToolCall) -> ChatToolCall {
    ChatToolCall {
        id: call.id.clone(),
        call_type: "function".to_string(),
        function: ChatToolCallFunction {
            name: call.name.clone(),
            arguments: call.arguments_json(),
        },
    }
}

fn encode_tool(tool: &ToolDefinition) -> ChatTool {
    ChatTool {
        tool_type: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: Some(tool.description.clone()),
            parameters: tool.parameters.clone(),
        },
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Required => ChatToolChoice::String("required".to_string()),
        ToolChoice::Specific(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    }
}

// ---------------------------------------------------------------------------
// Decoding (wire -> canonical)
// ---------------------------------------------------------------------------

/// Decode an OpenAI-dialect envelope. `family` only tags errors, since the
/// Google dialect shares this history shape.
pub fn decode_request(
    req: OpenAiRequest,
    family: ModelFamily,
    warnings: &mut Vec<String>,
) -> Result<CanonicalRequest> {
    let mut out = CanonicalRequest::new(req.model, decode_messages(&req.messages, family, warnings)?);
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.function.name,
            description: t.function.description.unwrap_or_default(),
            parameters: t.function.parameters,
        })
        .collect();
    out.tool_choice = req.tool_choice.and_then(|c| decode_tool_choice(c, warnings));
    out.stream = req.stream.unwrap_or(false);
    out.user = req.user;
    out.params.stop = req.stop;
    out.params.temperature = req.temperature;
    out.params.top_p = req.top_p;
    out.params.max_tokens = req.max_tokens;
    out.params.max_completion_tokens = req.max_completion_tokens;
    Ok(out)
}

pub fn decode_messages(
    messages: &[WireMessage],
    family: ModelFamily,
    warnings: &mut Vec<String>,
) -> Result<Vec<ChatMessage>> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| decode_message(m, family, &format!("messages[{i}]"), warnings))
        .collect()
}

fn decode_message(
    msg: &WireMessage,
    family: ModelFamily,
    path: &str,
    warnings: &mut Vec<String>,
) -> Result<ChatMessage> {
    let role = Role::parse(&msg.role).ok_or_else(|| {
        GatewayError::decode(family, format!("{path}.role"), format!("unknown role '{}'", msg.role))
    })?;

    let mut content = match role {
        Role::Tool => Vec::new(),
        _ => decode_content(msg.content.as_ref()),
    };

    match role {
        Role::Assistant => {
            for (j, call) in msg.tool_calls.iter().flatten().enumerate() {
                let (arguments, warning) = parse_arguments(&call.function.arguments);
                if let Some(w) = warning {
                    warnings.push(format!("{path}.tool_calls[{j}]: {w}"));
                }
                content.push(ContentPart::ToolUse(ToolCall::new(
                    call.id.clone(),
                    call.function.name.clone(),
                    arguments,
                )));
            }
        }
        Role::Tool => {
            let tool_use_id = msg.tool_call_id.clone().ok_or_else(|| {
                GatewayError::decode(family, format!("{path}.tool_call_id"), "missing tool_call_id")
            })?;
            content.push(ContentPart::ToolResult {
                tool_use_id,
                content: content_text(msg.content.as_ref()),
            });
        }
        Role::System | Role::User => {}
    }

    let mut out = ChatMessage::new(role, content);
    if role == Role::Tool {
        out.name = msg.name.clone();
    }
    Ok(out)
}

fn decode_content(content: Option<&ChatContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(ChatContent::Text(t)) if t.is_empty() => Vec::new(),
        Some(ChatContent::Text(t)) => vec![ContentPart::text(t.clone())],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                WirePart::Text { text } => ContentPart::text(text.clone()),
                WirePart::ImageUrl { image_url } => ContentPart::Image {
                    url: image_url.url.clone(),
                    mime: parse_data_url(&image_url.url).map(|(mime, _)| mime.to_string()),
                },
            })
            .collect(),
    }
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        None => String::new(),
        Some(ChatContent::Text(t)) => t.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                WirePart::Text { text } => Some(text.as_str()),
                WirePart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

pub fn decode_tool_choice(choice: ChatToolChoice, warnings: &mut Vec<String>) -> Option<ToolChoice> {
    match choice {
        ChatToolChoice::String(s) => {
            let parsed = ToolChoice::from_shorthand(&s);
            if parsed.is_none() {
                warnings.push(format!("ignored unknown tool_choice '{s}'"));
            }
            parsed
        }
        ChatToolChoice::Specific(spec) => Some(ToolChoice::Specific(spec.function.name)),
    }
}

/// Parse a serialized arguments string into an object. Anything unusable
/// becomes `{}` plus a warning.
pub fn parse_arguments(raw: &str) -> (Map<String, Value>, Option<String>) {
    if raw.trim().is_empty() {
        return (Map::new(), None);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => object_or_empty(value),
        Err(e) => (Map::new(), Some(format!("unparseable arguments: {e}"))),
    }
}

/// Accept a native arguments value, mapping `null` to `{}`.
pub fn object_or_empty(value: Value) -> (Map<String, Value>, Option<String>) {
    match value {
        Value::Object(map) => (map, None),
        Value::Null => (Map::new(), None),
        other => (
            Map::new(),
            Some(format!("arguments must be an object, got {other}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: Value) -> WireMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_assistant_arguments_become_objects() {
        let msgs = vec![wire(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "add", "arguments": "{\"a\":1}"}
            }]
        }))];

        let mut warnings = Vec::new();
        let decoded = decode_messages(&msgs, ModelFamily::OpenAi, &mut warnings).unwrap();
        let call = decoded[0].tool_calls().next().unwrap();
        assert_eq!(call.name, "add");
        assert_eq!(call.arguments["a"], 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bad_arguments_degrade_to_empty_object() {
        let (args, warning) = parse_arguments("{not json");
        assert!(args.is_empty());
        assert!(warning.is_some());

        let (args, warning) = parse_arguments("[1, 2]");
        assert!(args.is_empty());
        assert!(warning.is_some());

        let (args, warning) = parse_arguments("");
        assert!(args.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn test_unknown_role_is_decode_error() {
        let msgs = vec![wire(json!({"role": "narrator", "content": "once upon a time"}))];
        let err = decode_messages(&msgs, ModelFamily::OpenAi, &mut Vec::new()).unwrap_err();
        match err {
            GatewayError::Decode { path, .. } => assert_eq!(path, "messages[0].role"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_message_requires_call_id() {
        let msgs = vec![wire(json!({"role": "tool", "content": "42"}))];
        let err = decode_messages(&msgs, ModelFamily::Google, &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("messages[0].tool_call_id"));
        assert!(err.to_string().contains("google"));
    }

    #[test]
    fn test_encode_assistant_with_tool_call() {
        let mut args = Map::new();
        args.insert("city".to_string(), json!("Paris"));
        let msg = ChatMessage::new(
            Role::Assistant,
            vec![ContentPart::ToolUse(ToolCall::new("call_9", "weather", args))],
        );

        let out = encode_messages(&[msg], &mut Vec::new());
        assert!(out[0].content.is_none());
        let calls = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn test_missing_description_defaults_to_empty() {
        let req: OpenAiRequest = serde_json::from_value(json!({
            "model": "gpt4o",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "noop", "parameters": {}}}],
            "tool_choice": "required"
        }))
        .unwrap();

        let decoded = decode_request(req, ModelFamily::OpenAi, &mut Vec::new()).unwrap();
        assert_eq!(decoded.tools[0].description, "");
        assert_eq!(decoded.tool_choice, Some(ToolChoice::Required));
    }
}
