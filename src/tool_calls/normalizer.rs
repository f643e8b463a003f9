//! Final say on which tool calls a response carries.
//!
//! The structured channel always wins. Only when it is empty does the text
//! get inspected, first for Google `<tool_call>` tags, then for leaked
//! Anthropic literals.

use serde_json::Value;

use super::leaked;
use crate::logging::{truncate_raw, DiagnosticCandidate, DiagnosticEntry, DiagnosticSink};
use crate::models::ModelFamily;
use crate::translate::canonical::ToolCall;
use crate::translate::google;

pub struct NormalizerContext<'a> {
    pub model: &'a str,
    pub enable_leaked_tool_fix: bool,
    pub sink: Option<&'a dyn DiagnosticSink>,
    /// Attached to diagnostics so a leak can be replayed later.
    pub raw_response: Option<&'a Value>,
}

impl<'a> NormalizerContext<'a> {
    pub fn new(model: &'a str, enable_leaked_tool_fix: bool) -> Self {
        Self {
            model,
            enable_leaked_tool_fix,
            sink: None,
            raw_response: None,
        }
    }

    pub fn with_sink(mut self, sink: &'a dyn DiagnosticSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_raw_response(mut self, raw: &'a Value) -> Self {
        self.raw_response = Some(raw);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub tool_calls: Vec<ToolCall>,
    pub text: String,
}

pub fn process(
    raw_text: &str,
    structured: Vec<ToolCall>,
    family: ModelFamily,
    ctx: &NormalizerContext<'_>,
) -> Normalized {
    if !structured.is_empty() {
        if leaked::contains_leak(raw_text) {
            tracing::debug!(model = ctx.model, "Structured tool calls present, leak recovery skipped");
        }
        return Normalized {
            tool_calls: structured,
            text: raw_text.to_string(),
        };
    }

    if family == ModelFamily::Google && raw_text.contains("<tool_call>") {
        let (tool_calls, text) = google::extract_tagged_tool_calls(raw_text);
        if !tool_calls.is_empty() {
            tracing::info!(model = ctx.model, count = tool_calls.len(), "Extracted tagged tool calls");
            return Normalized { tool_calls, text };
        }
    }

    if !leaked::contains_leak(raw_text) {
        return Normalized {
            tool_calls: Vec::new(),
            text: raw_text.to_string(),
        };
    }

    let recovered = leaked::recover(raw_text);
    tracing::warn!(
        model = ctx.model,
        candidates = recovered.candidates.len(),
        recovered = recovered.tool_calls.len(),
        fix_enabled = ctx.enable_leaked_tool_fix,
        "Leaked tool call in response text"
    );
    report(&recovered.candidates, ctx);

    if ctx.enable_leaked_tool_fix {
        Normalized {
            tool_calls: recovered.tool_calls,
            text: recovered.text,
        }
    } else {
        Normalized {
            tool_calls: Vec::new(),
            text: raw_text.to_string(),
        }
    }
}

fn report(candidates: &[leaked::LeakedToolCandidate], ctx: &NormalizerContext<'_>) {
    let Some(sink) = ctx.sink else {
        return;
    };

    let entries = candidates
        .iter()
        .map(|c| DiagnosticCandidate {
            start: c.start,
            end: c.end,
            raw: truncate_raw(&c.raw),
            failure: c.outcome.as_ref().err().map(ToString::to_string),
        })
        .collect();

    let mut entry = DiagnosticEntry::new(ctx.model, ctx.enable_leaked_tool_fix, entries);
    if let Some(raw) = ctx.raw_response {
        entry = entry.with_raw_response(raw.clone());
    }
    sink.record(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<DiagnosticEntry>>);

    impl DiagnosticSink for MemorySink {
        fn record(&self, entry: DiagnosticEntry) {
            self.0.lock().unwrap().push(entry);
        }
    }

    const LEAKED: &str =
        "Let me check:{'id':'toolu_1','input':{'x':1},'name':'bash','type':'tool_use'}";

    #[test]
    fn test_leak_recovered_and_reported() {
        let sink = MemorySink::default();
        let raw = json!({"response": LEAKED});
        let ctx = NormalizerContext::new("claudesonnet4", true)
            .with_sink(&sink)
            .with_raw_response(&raw);

        let out = process(LEAKED, Vec::new(), ModelFamily::Anthropic, &ctx);
        assert_eq!(out.text, "Let me check:");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "toolu_1");
        assert_eq!(out.tool_calls[0].arguments["x"], 1);

        let entries = sink.0.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recovered, 1);
        assert!(entries[0].raw_response.is_some());
    }

    #[test]
    fn test_structured_channel_wins() {
        let sink = MemorySink::default();
        let ctx = NormalizerContext::new("claudesonnet4", true).with_sink(&sink);
        let structured = vec![ToolCall::new("toolu_real", "read", Map::new())];

        let out = process(LEAKED, structured, ModelFamily::Anthropic, &ctx);
        assert_eq!(out.text, LEAKED);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "toolu_real");
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_fix_only_records() {
        let sink = MemorySink::default();
        let ctx = NormalizerContext::new("claudeopus4", false).with_sink(&sink);

        let out = process(LEAKED, Vec::new(), ModelFamily::Anthropic, &ctx);
        assert_eq!(out.text, LEAKED);
        assert!(out.tool_calls.is_empty());

        let entries = sink.0.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].fix_enabled);
    }

    #[test]
    fn test_failed_recovery_keeps_text() {
        let text = "oops {'id': 'toolu_x', 'input': {}} tail";
        let sink = MemorySink::default();
        let ctx = NormalizerContext::new("claudesonnet4", true).with_sink(&sink);

        let out = process(text, Vec::new(), ModelFamily::Anthropic, &ctx);
        assert_eq!(out.text, text);
        assert!(out.tool_calls.is_empty());
        let entries = sink.0.lock().unwrap();
        assert_eq!(entries[0].candidates[0].failure.as_deref(), Some("missing or invalid field 'name'"));
    }

    #[test]
    fn test_google_tags() {
        let text = "Sure.\n<tool_call>{\"name\": \"add\", \"arguments\": {\"a\": 2}}</tool_call>";
        let ctx = NormalizerContext::new("gemini25pro", true);
        let out = process(text, Vec::new(), ModelFamily::Google, &ctx);
        assert_eq!(out.text, "Sure.");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "call_0");
        assert_eq!(out.tool_calls[0].name, "add");
    }

    #[test]
    fn test_plain_text_untouched() {
        let ctx = NormalizerContext::new("gpt4o", true);
        let out = process("just words {}", Vec::new(), ModelFamily::OpenAi, &ctx);
        assert_eq!(out.text, "just words {}");
        assert!(out.tool_calls.is_empty());
    }
}
