//! Envelope types for the upstream chat API.
//!
//! Every family shares one request envelope; only the message, tool and
//! tool-choice shapes differ. Non-streaming answers come back wrapped in a
//! `response` field that is either plain text or `{content, tool_calls}`.

use serde::{Deserialize, Deserializer, Serialize};

use super::{anthropic_types, google_types, openai_types};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "M: Deserialize<'de>, T: Deserialize<'de>, C: Deserialize<'de>"))]
pub struct UpstreamRequest<M, T, C> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub model: String,
    pub messages: Vec<M>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<C>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "one_or_many")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<openai_types::StopSequences>::deserialize(d)?.map(openai_types::StopSequences::into_vec))
}

pub type OpenAiRequest = UpstreamRequest<
    openai_types::ChatMessage,
    openai_types::ChatTool,
    openai_types::ChatToolChoice,
>;

pub type AnthropicRequest = UpstreamRequest<
    anthropic_types::Message,
    anthropic_types::Tool,
    anthropic_types::ToolChoice,
>;

pub type GoogleRequest = UpstreamRequest<
    openai_types::ChatMessage,
    google_types::FunctionDeclaration,
    google_types::GoogleToolChoice,
>;

/// A request in one family's dialect, ready to send.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProviderRequest {
    OpenAi(OpenAiRequest),
    Anthropic(AnthropicRequest),
    Google(GoogleRequest),
}

impl ProviderRequest {
    pub fn set_stream(&mut self, stream: bool) {
        let flag = Some(stream);
        match self {
            Self::OpenAi(r) => r.stream = flag,
            Self::Anthropic(r) => r.stream = flag,
            Self::Google(r) => r.stream = flag,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAi(r) => &r.model,
            Self::Anthropic(r) => &r.model,
            Self::Google(r) => &r.model,
        }
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamResponse {
    pub response: UpstreamPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UpstreamPayload {
    Text(String),
    Structured {
        #[serde(default)]
        content: Option<UpstreamContent>,
        #[serde(default)]
        tool_calls: Option<ToolCallsField>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UpstreamContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

/// Some families send a single call object instead of a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolCallsField {
    Many(Vec<serde_json::Value>),
    One(serde_json::Value),
}

impl ToolCallsField {
    pub fn into_vec(self) -> Vec<serde_json::Value> {
        match self {
            Self::Many(v) => v,
            Self::One(serde_json::Value::Null) => Vec::new(),
            Self::One(v) => vec![v],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_deserializes_without_default_tools() {
        let req: AnthropicRequest = serde_json::from_value(json!({
            "model": "claudesonnet4",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "any",
            "stop": "END"
        }))
        .unwrap();
        assert!(req.tools.is_none());
        assert!(matches!(req.tool_choice, Some(anthropic_types::ToolChoice::Shorthand(ref s)) if s == "any"));
        assert_eq!(req.stop, Some(vec!["END".to_string()]));
    }
}
