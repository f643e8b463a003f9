//! Canonical ⇄ Anthropic dialect.
//!
//! Tool results change role on the way out: consecutive canonical `tool`
//! messages become one `user` turn carrying `tool_result` blocks, and a user
//! turn with `tool_result` blocks expands back into `tool` messages.

use serde_json::Value;

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessageContent, Role as WireRole, Tool, ToolChoice as WireChoice,
    ToolChoiceAuto, ToolChoiceSpecific, ToolResultContent,
};
use super::canonical::{
    CanonicalRequest, ChatMessage, ContentPart, Role, ToolCall, ToolChoice, ToolDefinition,
};
use super::openai::object_or_empty;
use super::upstream_types::AnthropicRequest;
use crate::error::{GatewayError, Result};
use crate::images::parse_data_url;
use crate::models::ModelFamily;

// ---------------------------------------------------------------------------
// Encoding (canonical -> wire)
// ---------------------------------------------------------------------------

pub fn encode_request(req: &CanonicalRequest, warnings: &mut Vec<String>) -> AnthropicRequest {
    AnthropicRequest {
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

pub fn encode_messages(messages: &[ChatMessage], warnings: &mut Vec<String>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => WireRole::System,
            Role::User => WireRole::User,
            Role::Assistant => WireRole::Assistant,
            Role::Tool => {
                for part in &msg.content {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        content,
                    } = part
                    {
                        pending_results.push(ContentBlock::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: Some(ToolResultContent::Text(content.clone())),
                            is_error: None,
                        });
                    }
                }
                continue;
            }
        };

        if !pending_results.is_empty() {
            out.push(Message {
                role: WireRole::User,
                content: MessageContent::Blocks(std::mem::take(&mut pending_results)),
            });
        }

        let blocks = encode_blocks(msg, warnings);
        out.push(Message {
            role,
            content: collapse_blocks(blocks),
        });
    }

    if !pending_results.is_empty() {
        out.push(Message {
            role: WireRole::User,
            content: MessageContent::Blocks(pending_results),
        });
    }

    out
}

fn encode_blocks(msg: &ChatMessage, warnings: &mut Vec<String>) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for part in &msg.content {
        match part {
            ContentPart::Text { text } => blocks.push(ContentBlock::Text { text: text.clone() }),
            ContentPart::Image { url, .. } => match parse_data_url(url) {
                Some((media_type, data)) => blocks.push(ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: Some(media_type.to_string()),
                        data: Some(data.to_string()),
                        url: None,
                    },
                }),
                None => warnings.push(format!("dropped non-inlined image {url}")),
            },
            ContentPart::ToolUse(call) if msg.role == Role::Assistant => {
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: Value::Object(call.arguments.clone()),
                });
            }
            ContentPart::ToolUse(_) | ContentPart::ToolResult { .. } => warnings.push(format!(
                "dropped tool content inside a {} message",
                msg.role.as_str()
            )),
        }
    }
    blocks
}

fn collapse_blocks(blocks: Vec<ContentBlock>) -> MessageContent {
    if blocks.is_empty() {
        return MessageContent::Text(String::new());
    }
    if let [ContentBlock::Text { text }] = blocks.as_slice() {
        return MessageContent::Text(text.clone());
    }
    MessageContent::Blocks(blocks)
}

fn encode_tool(tool: &ToolDefinition) -> Tool {
    Tool {
        name: tool.name.clone(),
        description: Some(tool.description.clone()),
        input_schema: tool.parameters.clone(),
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> WireChoice {
    let simple = |t: &str| {
        WireChoice::Auto(ToolChoiceAuto {
            choice_type: t.to_string(),
        })
    };
    match choice {
        ToolChoice::Auto => simple("auto"),
        ToolChoice::None => simple("none"),
        ToolChoice::Required => simple("any"),
        ToolChoice::Specific(name) => WireChoice::Specific(ToolChoiceSpecific {
            choice_type: "tool".to_string(),
            name: name.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Decoding (wire -> canonical)
// ---------------------------------------------------------------------------

pub fn decode_request(req: AnthropicRequest, warnings: &mut Vec<String>) -> Result<CanonicalRequest> {
    let mut out = CanonicalRequest::new(req.model, decode_messages(&req.messages, warnings)?);
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description.unwrap_or_default(),
            parameters: t.input_schema,
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

pub fn decode_messages(messages: &[Message], warnings: &mut Vec<String>) -> Result<Vec<ChatMessage>> {
    let mut out = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        let path = format!("messages[{i}]");
        let mut parts: Vec<ContentPart> = Vec::new();
        let role = match msg.role {
            WireRole::System => Role::System,
            WireRole::User => Role::User,
            WireRole::Assistant => Role::Assistant,
        };

        for (j, block) in msg.content.blocks().into_iter().enumerate() {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(ContentPart::Text { text });
                    }
                }
                ContentBlock::Image { source } => {
                    parts.push(decode_image(source, &format!("{path}.content[{j}]"))?);
                }
                ContentBlock::ToolUse { id, name, input } if role == Role::Assistant => {
                    let (arguments, warning) = object_or_empty(input);
                    if let Some(w) = warning {
                        warnings.push(format!("{path}.content[{j}]: {w}"));
                    }
                    parts.push(ContentPart::ToolUse(ToolCall::new(id, name, arguments)));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } if role == Role::User => {
                    // Results become their own tool turns, in block order.
                    if !parts.is_empty() {
                        out.push(ChatMessage::new(role, std::mem::take(&mut parts)));
                    }
                    let mut text = content.map(|c| c.as_text()).unwrap_or_default();
                    if is_error == Some(true) {
                        text = format!("ERROR: {text}");
                    }
                    out.push(ChatMessage::new(
                        Role::Tool,
                        vec![ContentPart::ToolResult {
                            tool_use_id,
                            content: text,
                        }],
                    ));
                }
                ContentBlock::Thinking { .. } => {
                    warnings.push(format!("{path}.content[{j}]: dropped thinking block"));
                }
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
                    warnings.push(format!(
                        "{path}.content[{j}]: dropped tool block in a {} turn",
                        role.as_str()
                    ));
                }
            }
        }

        if !parts.is_empty() || !matches!(msg.content, MessageContent::Blocks(_)) {
            out.push(ChatMessage::new(role, parts));
        }
    }

    Ok(out)
}

fn decode_image(source: ImageSource, path: &str) -> Result<ContentPart> {
    match source.source_type.as_str() {
        "base64" => {
            let media_type = source.media_type.ok_or_else(|| {
                GatewayError::decode(ModelFamily::Anthropic, format!("{path}.source.media_type"), "missing media_type")
            })?;
            let data = source.data.ok_or_else(|| {
                GatewayError::decode(ModelFamily::Anthropic, format!("{path}.source.data"), "missing data")
            })?;
            Ok(ContentPart::Image {
                url: format!("data:{media_type};base64,{data}"),
                mime: Some(media_type),
            })
        }
        "url" => {
            let url = source.url.ok_or_else(|| {
                GatewayError::decode(ModelFamily::Anthropic, format!("{path}.source.url"), "missing url")
            })?;
            Ok(ContentPart::Image { url, mime: None })
        }
        other => Err(GatewayError::decode(
            ModelFamily::Anthropic,
            format!("{path}.source.type"),
            format!("unsupported image source '{other}'"),
        )),
    }
}

pub fn decode_tool_choice(choice: WireChoice, warnings: &mut Vec<String>) -> Option<ToolChoice> {
    let shorthand = match choice {
        WireChoice::Specific(spec) => return Some(ToolChoice::Specific(spec.name)),
        WireChoice::Shorthand(s) => s,
        WireChoice::Auto(auto) => auto.choice_type,
    };
    let parsed = ToolChoice::from_shorthand(&shorthand);
    if parsed.is_none() {
        warnings.push(format!("ignored unknown tool_choice '{shorthand}'"));
    }
    parsed
}
