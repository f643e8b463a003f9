//! Canonical ⇄ Google (Gemini) dialect.
//!
//! Gemini emits tool calls in parallel and usually without ids. On the way
//! out, parallel calls in history are rewritten into sequential call/result
//! pairs. On the way back, calls get synthetic `call_<n>` ids in their
//! original order.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::canonical::{CanonicalRequest, ToolCall, ToolChoice, ToolDefinition};
use super::google_types::{
    FunctionCall, FunctionCallingConfig, FunctionDeclaration, GoogleToolChoice, ToolConfig,
};
use super::openai;
use super::openai::object_or_empty;
use super::openai_types::{ChatContent, ChatMessage as WireMessage};
use super::upstream_types::GoogleRequest;
use crate::error::Result;
use crate::models::ModelFamily;

static TOOL_CALL_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").unwrap()
});

// ---------------------------------------------------------------------------
// Encoding (canonical -> wire)
// ---------------------------------------------------------------------------

pub fn encode_request(req: &CanonicalRequest, warnings: &mut Vec<String>) -> GoogleRequest {
    let messages = openai::encode_messages(&req.messages, warnings);

    GoogleRequest {
        user: req.user.clone(),
        model: req.model.clone(),
        messages: sequentialize_tool_calls(messages, warnings),
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

fn encode_tool(tool: &ToolDefinition) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.name.clone(),
        description: Some(tool.description.clone()),
        parameters: tool.parameters.clone(),
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> GoogleToolChoice {
    let (mode, allowed) = match choice {
        ToolChoice::Auto => ("AUTO", None),
        ToolChoice::None => ("NONE", None),
        ToolChoice::Required => ("ANY", None),
        ToolChoice::Specific(name) => ("ANY", Some(vec![name.clone()])),
    };
    GoogleToolChoice::Config(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}

/// Rewrite each assistant turn holding several tool calls, followed by its
/// tool results, into one assistant/tool pair per call.
///
/// Results are matched to calls by id, falling back to position. A call with
/// no result is dropped, as is a result with no call. Only the first pair
/// keeps the assistant's text. Tool messages also get the function `name`
/// the dialect expects.
pub fn sequentialize_tool_calls(messages: Vec<WireMessage>, warnings: &mut Vec<String>) -> Vec<WireMessage> {
    let mut names: HashMap<String, String> = HashMap::new();
    for msg in &messages {
        for call in msg.tool_calls.iter().flatten() {
            names.insert(call.id.clone(), call.function.name.clone());
        }
    }

    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(mut msg) = iter.next() {
        if msg.role == "tool" {
            fill_tool_name(&mut msg, &names);
            out.push(msg);
            continue;
        }

        let parallel = msg.role == "assistant" && msg.tool_calls.as_ref().is_some_and(|c| c.len() > 1);
        if !parallel {
            out.push(msg);
            continue;
        }

        let mut results = Vec::new();
        while let Some(next) = iter.next_if(|m| m.role == "tool") {
            results.push(next);
        }
        if results.is_empty() {
            // Calls still awaiting results stay as they are.
            out.push(msg);
            continue;
        }

        let calls = msg.tool_calls.take().unwrap_or_default();
        let mut used = vec![false; results.len()];
        let mut text = msg.content.take();

        for (idx, call) in calls.into_iter().enumerate() {
            let by_id = results
                .iter()
                .position(|r| r.tool_call_id.as_deref() == Some(call.id.as_str()))
                .filter(|&r| !used[r]);
            let matched = by_id.or_else(|| (idx < results.len() && !used[idx]).then_some(idx));

            let Some(r) = matched else {
                warnings.push(format!("dropped tool call {} with no matching result", call.id));
                continue;
            };
            used[r] = true;

            let mut result = results[r].clone();
            if result.tool_call_id.as_deref() != Some(call.id.as_str()) {
                warnings.push(format!(
                    "paired tool call {} with result {:?} by position",
                    call.id, result.tool_call_id
                ));
                result.tool_call_id = Some(call.id.clone());
            }
            fill_tool_name(&mut result, &names);

            let mut assistant = WireMessage::new("assistant", text.take().or(Some(ChatContent::Text(String::new()))));
            assistant.tool_calls = Some(vec![call]);
            out.push(assistant);
            out.push(result);
        }

        for (r, was_used) in used.iter().enumerate() {
            if !was_used {
                warnings.push(format!(
                    "dropped tool result {:?} with no matching call",
                    results[r].tool_call_id
                ));
            }
        }
    }

    out
}

fn fill_tool_name(msg: &mut WireMessage, names: &HashMap<String, String>) {
    if msg.name.is_none() {
        msg.name = msg
            .tool_call_id
            .as_ref()
            .and_then(|id| names.get(id))
            .cloned();
    }
}

// ---------------------------------------------------------------------------
// Decoding (wire -> canonical)
// ---------------------------------------------------------------------------

pub fn decode_request(req: GoogleRequest, warnings: &mut Vec<String>) -> Result<CanonicalRequest> {
    let messages = openai::decode_messages(&req.messages, ModelFamily::Google, warnings)?;
    let mut out = CanonicalRequest::new(req.model, messages);
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description.unwrap_or_default(),
            parameters: t.parameters,
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

pub fn decode_tool_choice(choice: GoogleToolChoice, warnings: &mut Vec<String>) -> Option<ToolChoice> {
    match choice {
        GoogleToolChoice::Shorthand(s) => {
            let parsed = ToolChoice::from_shorthand(&s);
            if parsed.is_none() {
                warnings.push(format!("ignored unknown tool_choice '{s}'"));
            }
            parsed
        }
        GoogleToolChoice::Config(config) => {
            let FunctionCallingConfig {
                mode,
                allowed_function_names,
            } = config.function_calling_config;
            match mode.to_ascii_uppercase().as_str() {
                "AUTO" => Some(ToolChoice::Auto),
                "NONE" => Some(ToolChoice::None),
                "ANY" => match allowed_function_names.as_deref() {
                    Some([only]) => Some(ToolChoice::Specific(only.clone())),
                    Some([_, _, ..]) => {
                        warnings.push("narrowed allowed_function_names to required".to_string());
                        Some(ToolChoice::Required)
                    }
                    _ => Some(ToolChoice::Required),
                },
                other => {
                    warnings.push(format!("ignored unknown function calling mode '{other}'"));
                    None
                }
            }
        }
    }
}

/// Convert upstream function calls, assigning `call_<n>` to any without an id.
/// Synthetic ids skip any id already present in the response.
pub fn decode_function_calls(calls: Vec<FunctionCall>, warnings: &mut Vec<String>) -> Vec<ToolCall> {
    let mut taken: HashSet<String> = calls
        .iter()
        .filter_map(|c| c.id.clone())
        .filter(|id| !id.is_empty())
        .collect();

    calls
        .into_iter()
        .enumerate()
        .map(|(n, call)| {
            let (arguments, warning) = object_or_empty(call.args);
            if let Some(w) = warning {
                warnings.push(format!("tool_calls[{n}]: {w}"));
            }
            let id = match call.id.filter(|id| !id.is_empty()) {
                Some(id) => id,
                None => {
                    let id = (n..)
                        .map(|k| format!("call_{k}"))
                        .find(|id| !taken.contains(id))
                        .unwrap_or_default();
                    taken.insert(id.clone());
                    id
                }
            };
            ToolCall::new(id, call.name, arguments)
        })
        .collect()
}

/// Pull `<tool_call>{...}</tool_call>` blocks out of Gemini text.
///
/// Returns the calls in order and the text with every parsed tag removed.
/// Tags whose body is not a `{name, arguments|args}` object are left in place.
pub fn extract_tagged_tool_calls(text: &str) -> (Vec<ToolCall>, String) {
    let mut calls = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut last = 0;

    for caps in TOOL_CALL_TAG_RE.captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(call) = parse_tagged_body(body.as_str(), calls.len()) else {
            continue;
        };
        cleaned.push_str(&text[last..whole.start()]);
        last = whole.end();
        calls.push(call);
    }
    cleaned.push_str(&text[last..]);

    if calls.is_empty() {
        (calls, text.to_string())
    } else {
        (calls, cleaned.trim().to_string())
    }
}

fn parse_tagged_body(body: &str, n: usize) -> Option<ToolCall> {
    let Value::Object(mut obj) = serde_json::from_str::<Value>(body).ok()? else {
        return None;
    };
    let name = obj.remove("name")?.as_str()?.to_string();
    let raw_args = obj
        .remove("arguments")
        .or_else(|| obj.remove("args"))
        .unwrap_or(Value::Null);
    let (arguments, _) = match raw_args {
        Value::String(s) => openai::parse_arguments(&s),
        other => object_or_empty(other),
    };
    Some(ToolCall::new(format!("call_{n}"), name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::{ChatToolCall, ChatToolCallFunction};
    use serde_json::json;

    fn call(id: &str, name: &str) -> ChatToolCall {
        ChatToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments: "{}".to_string(),
            },
        }
    }

    fn tool_result(id: &str, content: &str) -> WireMessage {
        let mut msg = WireMessage::new("tool", Some(ChatContent::Text(content.to_string())));
        msg.tool_call_id = Some(id.to_string());
        msg
    }

    #[test]
    fn test_parallel_calls_become_sequential_pairs() {
        let mut assistant = WireMessage::new("assistant", Some(ChatContent::Text("checking".to_string())));
        assistant.tool_calls = Some(vec![call("call_a", "weather"), call("call_b", "time")]);
        let messages = vec![
            WireMessage::new("user", Some(ChatContent::Text("hi".to_string()))),
            assistant,
            tool_result("call_b", "noon"),
            tool_result("call_a", "sunny"),
        ];

        let mut warnings = Vec::new();
        let out = sequentialize_tool_calls(messages, &mut warnings);

        let roles: Vec<&str> = out.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant", "tool"]);
        assert_eq!(out[1].tool_calls.as_ref().unwrap()[0].id, "call_a");
        assert_eq!(out[2].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(out[2].name.as_deref(), Some("weather"));
        assert_eq!(out[4].tool_call_id.as_deref(), Some("call_b"));
        assert!(matches!(&out[1].content, Some(ChatContent::Text(t)) if t == "checking"));
        assert!(matches!(&out[3].content, Some(ChatContent::Text(t)) if t.is_empty()));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_positional_fallback_when_ids_disagree() {
        let mut assistant = WireMessage::new("assistant", None);
        assistant.tool_calls = Some(vec![call("call_0", "f"), call("call_1", "g")]);
        let messages = vec![assistant, tool_result("x", "one"), tool_result("y", "two")];

        let mut warnings = Vec::new();
        let out = sequentialize_tool_calls(messages, &mut warnings);
        assert_eq!(out.len(), 4);
        assert_eq!(out[1].tool_call_id.as_deref(), Some("call_0"));
        assert_eq!(out[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_synthetic_ids_follow_order() {
        let calls: Vec<FunctionCall> = serde_json::from_value(json!([
            {"id": null, "name": "add", "args": {"a": 1}},
            {"name": "mul", "args": {"b": 2}},
            {"id": "given", "name": "sub", "args": {}}
        ]))
        .unwrap();

        let out = decode_function_calls(calls, &mut Vec::new());
        let ids: Vec<&str> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["call_0", "call_1", "given"]);
        assert_eq!(out[0].arguments["a"], 1);
    }

    #[test]
    fn test_synthetic_ids_skip_taken_ids() {
        let calls: Vec<FunctionCall> = serde_json::from_value(json!([
            {"id": "call_1", "name": "add", "args": {}},
            {"id": null, "name": "mul", "args": {}},
            {"name": "sub", "args": {}}
        ]))
        .unwrap();

        let out = decode_function_calls(calls, &mut Vec::new());
        let ids: Vec<&str> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["call_1", "call_2", "call_3"]);
    }

    #[test]
    fn test_tool_config_modes() {
        let mut warnings = Vec::new();
        let choice: GoogleToolChoice = serde_json::from_value(json!({
            "function_calling_config": {"mode": "ANY", "allowed_function_names": ["add"]}
        }))
        .unwrap();
        assert_eq!(
            decode_tool_choice(choice, &mut warnings),
            Some(ToolChoice::Specific("add".to_string()))
        );

        let choice: GoogleToolChoice = serde_json::from_value(json!("any")).unwrap();
        assert_eq!(decode_tool_choice(choice, &mut warnings), Some(ToolChoice::Required));

        let encoded = serde_json::to_value(encode_tool_choice(&ToolChoice::None)).unwrap();
        assert_eq!(encoded["function_calling_config"]["mode"], "NONE");
    }

    #[test]
    fn test_tagged_tool_calls_are_extracted() {
        let text = "Sure.\n<tool_call>\n{\"name\": \"add\", \"arguments\": {\"a\": 1, \"b\": 2}}\n</tool_call>";
        let (calls, cleaned) = extract_tagged_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].arguments["b"], 2);
        assert_eq!(cleaned, "Sure.");
    }

    #[test]
    fn test_malformed_tag_is_left_alone() {
        let text = "<tool_call>{not json}</tool_call>";
        let (calls, cleaned) = extract_tagged_tool_calls(text);
        assert!(calls.is_empty());
        assert_eq!(cleaned, text);
    }
}
