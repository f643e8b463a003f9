//! Token accounting for responses the upstream does not meter.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::{GatewayError, Result};
use crate::translate::canonical::{CanonicalRequest, ContentPart, ToolCall, UsageRecord};

/// Overhead of the role/separator tokens around each message.
const TOKENS_PER_MESSAGE: u64 = 3;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: u64 = 3;
/// Flat estimate for an image at low detail.
const IMAGE_TOKENS: u64 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100k,
    O200k,
}

/// Pick the BPE a model id is closest to.
pub fn encoding_for(model: &str) -> Encoding {
    let lower = model.to_ascii_lowercase();
    let normalized: String = lower
        .strip_prefix("argo:")
        .unwrap_or(&lower)
        .chars()
        .filter(|c| !matches!(c, '-' | '.' | '_'))
        .collect();

    const O200K_PREFIXES: [&str; 7] = ["gpt4o", "gpto", "o1", "o3", "o4", "gpt41", "gpt5"];
    if O200K_PREFIXES.iter().any(|p| normalized.starts_with(p)) {
        Encoding::O200k
    } else {
        Encoding::Cl100k
    }
}

/// Both tokenizers, loaded once and shared.
#[derive(Clone)]
pub struct TokenCounter {
    cl100k: Arc<CoreBPE>,
    o200k: Arc<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Result<Self> {
        let cl100k = tiktoken_rs::cl100k_base()
            .map_err(|e| GatewayError::config(format!("Failed to load cl100k tokenizer: {e}")))?;
        let o200k = tiktoken_rs::o200k_base()
            .map_err(|e| GatewayError::config(format!("Failed to load o200k tokenizer: {e}")))?;
        Ok(Self {
            cl100k: Arc::new(cl100k),
            o200k: Arc::new(o200k),
        })
    }

    fn bpe(&self, encoding: Encoding) -> &CoreBPE {
        match encoding {
            Encoding::Cl100k => &self.cl100k,
            Encoding::O200k => &self.o200k,
        }
    }

    pub fn count_text(&self, model: &str, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.bpe(encoding_for(model)).encode_with_special_tokens(text).len() as u64
    }

    fn count_call(&self, model: &str, call: &ToolCall) -> u64 {
        self.count_text(model, &call.name) + self.count_text(model, &call.arguments_json())
    }

    pub fn prompt_tokens(&self, req: &CanonicalRequest) -> u64 {
        let model = req.model.as_str();

        let messages: u64 = req
            .messages
            .iter()
            .map(|msg| {
                let content: u64 = msg
                    .content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => self.count_text(model, text),
                        ContentPart::Image { .. } => IMAGE_TOKENS,
                        ContentPart::ToolUse(call) => self.count_call(model, call),
                        ContentPart::ToolResult { content, .. } => self.count_text(model, content),
                    })
                    .sum();
                let name = msg.name.as_deref().map_or(0, |n| self.count_text(model, n) + 1);
                TOKENS_PER_MESSAGE + content + name
            })
            .sum();

        let tools: u64 = req
            .tools
            .iter()
            .map(|tool| {
                self.count_text(model, &tool.name)
                    + self.count_text(model, &tool.description)
                    + self.count_text(model, &tool.parameters.to_string())
            })
            .sum();

        messages + tools + REPLY_PRIMING_TOKENS
    }

    /// Completion cost of what the client actually received.
    pub fn completion_tokens(&self, model: &str, text: &str, calls: &[ToolCall]) -> u64 {
        self.count_text(model, text) + calls.iter().map(|c| self.count_call(model, c)).sum::<u64>()
    }

    pub fn usage(&self, req: &CanonicalRequest, text: &str, calls: &[ToolCall]) -> UsageRecord {
        UsageRecord::new(
            self.prompt_tokens(req),
            self.completion_tokens(&req.model, text, calls),
        )
    }
}
