//! Recovery of tool calls that leaked into response text.
//!
//! Some Anthropic-family responses carry a tool call as a Python dict literal
//! inside the text instead of on the structured channel, e.g.
//! `Let me search.{'id': 'toolu_01X', 'input': {'q': 'x'}, 'name': 'search', 'type': 'tool_use'}`.
//!
//! Each marker occurrence becomes a [`LeakedToolCandidate`]: the span is
//! bounded by a quote-aware brace scan, then decoded with a fixed list of
//! repairs. One bad candidate never stops the scan.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::literal;
use crate::translate::canonical::ToolCall;

/// Start of a leaked tool literal.
pub static LEAK_SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*['"]id['"]\s*:\s*['"]toolu_"#).unwrap());

/// A `}}` followed by another top-level key: the model closed `input` twice.
static STRAY_BRACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\}\},[ \n\r]*?('name'|"name"|'type'|"type")"#).unwrap());

static STRAY_CONTINUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^,[ \n\r]*('name'|"name"|'type'|"type")\s*:"#).unwrap());

pub fn contains_leak(text: &str) -> bool {
    LEAK_SIGNATURE.is_match(text)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryFailure {
    #[error("no balanced closing brace")]
    Unbalanced,
    #[error("not decodable after repairs")]
    Undecodable,
    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeakedToolCandidate {
    /// Byte offset of the opening brace.
    pub start: usize,
    /// Byte offset one past the closing brace (or past the marker when unbalanced).
    pub end: usize,
    pub raw: String,
    pub outcome: Result<ToolCall, RecoveryFailure>,
}

impl LeakedToolCandidate {
    pub fn is_recovered(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recovered {
    pub tool_calls: Vec<ToolCall>,
    /// Input text with every recovered span removed.
    pub text: String,
    pub candidates: Vec<LeakedToolCandidate>,
}

/// Bytes of brace scanning allowed per input byte, plus a floor for short
/// texts. Unclosed markers scan to the end of the text, so without a cap a
/// run of them costs quadratic time.
const SCAN_BUDGET_PER_BYTE: usize = 4;
const SCAN_BUDGET_FLOOR: usize = 64 * 1024;

/// Locate and decode every leaked literal in `text`, left to right.
///
/// Total scan work is bounded by the text length. Once the budget is spent,
/// remaining markers are reported as unbalanced without scanning.
pub fn find_candidates(text: &str) -> Vec<LeakedToolCandidate> {
    let mut candidates = Vec::new();
    let mut pos = 0;
    let mut budget = text
        .len()
        .saturating_mul(SCAN_BUDGET_PER_BYTE)
        .saturating_add(SCAN_BUDGET_FLOOR);

    while let Some(m) = LEAK_SIGNATURE.find_at(text, pos) {
        let start = m.start();
        let unbalanced = LeakedToolCandidate {
            start,
            end: m.end(),
            raw: text[start..m.end()].to_string(),
            outcome: Err(RecoveryFailure::Unbalanced),
        };

        let limit = start + budget.min(text.len() - start);
        let quoted = scan_object_end(text, start, limit);
        budget -= quoted.map_or(limit, |end| end) - start;

        let candidate = if let Some(end) = quoted {
            let raw = &text[start..end];
            LeakedToolCandidate {
                start,
                end,
                raw: raw.to_string(),
                outcome: decode_candidate(raw),
            }
        } else {
            let limit = start + budget.min(text.len() - start);
            let plain = plain_object_len(&text.as_bytes()[start..limit]);
            budget -= plain.unwrap_or(limit - start);

            match plain {
                // Quote tracking never balanced; plain brace counting is only
                // trusted when the result decodes.
                Some(len) => match decode_candidate(&text[start..start + len]) {
                    Ok(call) => LeakedToolCandidate {
                        start,
                        end: start + len,
                        raw: text[start..start + len].to_string(),
                        outcome: Ok(call),
                    },
                    Err(_) => unbalanced,
                },
                None => unbalanced,
            }
        };
        pos = candidate.end;
        candidates.push(candidate);
    }

    candidates
}

/// Recover all decodable candidates and excise their spans from the text.
pub fn recover(text: &str) -> Recovered {
    let candidates = find_candidates(text);

    let mut cleaned = String::with_capacity(text.len());
    let mut tool_calls = Vec::new();
    let mut cursor = 0;
    for candidate in &candidates {
        if let Ok(call) = &candidate.outcome {
            cleaned.push_str(&text[cursor..candidate.start]);
            cursor = candidate.end;
            tool_calls.push(call.clone());
        }
    }
    cleaned.push_str(&text[cursor..]);

    Recovered {
        tool_calls,
        text: cleaned,
        candidates,
    }
}

/// Byte offset one past the brace closing the object opened at `start`.
///
/// Braces inside quoted strings are ignored. A quote preceded by an odd run
/// of backslashes is escaped. A `}` that closes the object early but is
/// directly followed by another `'name'`/`'type'` key is treated as stray.
/// Scanning stops at `limit`.
fn scan_object_end(text: &str, start: usize, limit: usize) -> Option<usize> {
    let bytes = &text.as_bytes()[..limit];
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut backslashes = 0usize;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(q) = quote {
            if b == b'\\' {
                backslashes += 1;
                continue;
            }
            if b == q && backslashes % 2 == 0 {
                quote = None;
            }
            backslashes = 0;
            continue;
        }

        match b {
            b'\'' | b'"' => quote = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if STRAY_CONTINUATION.is_match(&text[i + 1..]) {
                        depth = 1;
                    } else {
                        return Some(i + 1);
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Decode a bounded candidate, trying each repair in turn.
fn decode_candidate(raw: &str) -> Result<ToolCall, RecoveryFailure> {
    let mut shape_failure = None;

    for attempt in repairs(raw) {
        let Ok(value) = literal::parse(&attempt) else {
            continue;
        };
        match validate(value) {
            Ok(call) => return Ok(call),
            Err(failure) => {
                shape_failure.get_or_insert(failure);
            }
        }
    }

    Err(shape_failure.unwrap_or(RecoveryFailure::Undecodable))
}

/// The original text followed by each repair, in order, without repeats.
fn repairs(raw: &str) -> Vec<Cow<'_, str>> {
    let newlines = escape_raw_newlines(raw);
    let quotes = unescape_doubled_quotes(raw);
    let both = unescape_doubled_quotes(&newlines).into_owned();
    let stray = STRAY_BRACE.replace_all(raw, "}, $1");
    let newlines_stray = STRAY_BRACE.replace_all(&newlines, "}, $1").into_owned();
    let trimmed = trim_to_balanced(raw);
    let newlines_trimmed = escape_raw_newlines(trimmed).into_owned();

    let ordered = [
        Cow::Borrowed(raw),
        newlines.clone(),
        quotes,
        Cow::Owned(both),
        stray,
        Cow::Owned(newlines_stray),
        Cow::Borrowed(trimmed),
        Cow::Owned(newlines_trimmed),
    ];

    let mut out: Vec<Cow<'_, str>> = Vec::with_capacity(ordered.len());
    for attempt in ordered {
        if !out.iter().any(|seen| *seen == attempt) {
            out.push(attempt);
        }
    }
    out
}

/// Raw line breaks inside quoted strings become `\n`/`\r` escapes.
fn escape_raw_newlines(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\n', '\r']) {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len() + 8);
    let mut quote: Option<char> = None;
    let mut backslashes = 0usize;
    for c in raw.chars() {
        match quote {
            Some(q) => {
                match c {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
                if c == '\\' {
                    backslashes += 1;
                    continue;
                }
                if c == q && backslashes % 2 == 0 {
                    quote = None;
                }
                backslashes = 0;
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    Cow::Owned(out)
}

/// `\\'` becomes `\'`.
fn unescape_doubled_quotes(raw: &str) -> Cow<'_, str> {
    if raw.contains(r"\\'") {
        Cow::Owned(raw.replace(r"\\'", r"\'"))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Prefix ending where plain brace counting (ignoring quotes) first balances.
///
/// Recovers candidates whose quote tracking went wrong on an unescaped
/// apostrophe and swallowed trailing text.
fn trim_to_balanced(raw: &str) -> &str {
    plain_object_len(raw.as_bytes()).map_or(raw, |len| &raw[..len])
}

fn plain_object_len(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn validate(value: Value) -> Result<ToolCall, RecoveryFailure> {
    let Value::Object(mut obj) = value else {
        return Err(RecoveryFailure::MissingField("id"));
    };

    let id = match obj.remove("id") {
        Some(Value::String(id)) if id.starts_with("toolu_") => id,
        _ => return Err(RecoveryFailure::MissingField("id")),
    };
    let name = match obj.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(RecoveryFailure::MissingField("name")),
    };
    let arguments = match obj.remove("input") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(input)) => input,
        Some(_) => return Err(RecoveryFailure::MissingField("input")),
    };

    Ok(ToolCall::new(id, name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaked(id: &str, name: &str, input: &str) -> String {
        format!("{{'id': '{id}', 'input': {input}, 'name': '{name}', 'type': 'tool_use'}}")
    }

    #[test]
    fn test_let_me_check() {
        let text = "Let me check:{'id':'toolu_1','input':{'x':1},'name':'bash','type':'tool_use'}";
        let rec = recover(text);
        assert_eq!(rec.text, "Let me check:");
        assert_eq!(rec.tool_calls.len(), 1);
        assert_eq!(rec.tool_calls[0].id, "toolu_1");
        assert_eq!(rec.tool_calls[0].name, "bash");
        assert_eq!(Value::Object(rec.tool_calls[0].arguments.clone()), json!({"x": 1}));
    }

    #[test]
    fn test_brace_inside_quoted_argument() {
        let call = leaked("toolu_a", "bash", r#"{'command': 'find . -exec rm {} \\; && echo "}"'}"#);
        let text = format!("Running:{call} done");
        let candidates = find_candidates(&text);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].raw, call);
        let recovered = candidates[0].outcome.as_ref().unwrap();
        assert_eq!(
            recovered.arguments["command"],
            r#"find . -exec rm {} \; && echo "}""#
        );
        assert_eq!(recover(&text).text, "Running: done");
    }

    #[test]
    fn test_three_candidates_in_order() {
        let text = format!(
            "First {} then {} and finally {}.",
            leaked("toolu_1", "read", "{'path': 'a.txt'}"),
            leaked("toolu_2", "write", "{'path': 'b.txt', 'body': '{nested}'}"),
            leaked("toolu_3", "bash", "{'cmd': 'ls'}"),
        );
        let rec = recover(&text);
        let names: Vec<&str> = rec.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["read", "write", "bash"]);
        assert_eq!(rec.tool_calls[1].arguments["body"], "{nested}");
        assert_eq!(rec.tool_calls[2].arguments["cmd"], "ls");
        assert_eq!(rec.text, "First  then  and finally .");
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let text = format!(
            "a{}b{{'id': 'toolu_bad', 'input': {{}}}}c",
            leaked("toolu_1", "f", "{}")
        );
        let first = recover(&text);
        assert_eq!(first.tool_calls.len(), 1);
        let second = recover(&first.text);
        assert!(second.tool_calls.is_empty());
        assert_eq!(second.text, first.text);
        // Only the already-failed candidate is seen again.
        assert_eq!(second.candidates.len(), 1);
        assert!(!second.candidates[0].is_recovered());
    }

    #[test]
    fn test_missing_name_is_unrecoverable() {
        let text = "x{'id': 'toolu_9', 'input': {'a': 1}}y";
        let rec = recover(text);
        assert!(rec.tool_calls.is_empty());
        assert_eq!(rec.text, text);
        assert_eq!(
            rec.candidates[0].outcome,
            Err(RecoveryFailure::MissingField("name"))
        );
    }

    #[test]
    fn test_unbalanced_does_not_block_later_candidates() {
        let text = format!(
            "{{'id': 'toolu_cut', 'input': {{'a': 'b' ... {}",
            leaked("toolu_2", "g", "{}")
        );
        let rec = recover(&text);
        // The truncated literal swallows the next one's braces, so only the
        // inner marker can be bounded.
        assert_eq!(rec.candidates.len(), 2);
        assert_eq!(rec.candidates[0].outcome, Err(RecoveryFailure::Unbalanced));
        assert_eq!(rec.tool_calls.len(), 1);
        assert_eq!(rec.tool_calls[0].id, "toolu_2");
    }

    #[test]
    fn test_many_unclosed_markers_stay_linear() {
        let text = "{'id': 'toolu_x', 'input': {'a': 'b' ".repeat(5_000);
        let started = std::time::Instant::now();
        let candidates = find_candidates(&text);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(candidates.len(), 5_000);
        assert!(candidates
            .iter()
            .all(|c| c.outcome == Err(RecoveryFailure::Unbalanced)));
    }

    #[test]
    fn test_unclosed_marker_in_multibyte_text() {
        let text = format!("{{'id': 'toolu_u', 'input': {{'a': '{}", "é".repeat(40_000));
        let rec = recover(&text);
        assert_eq!(rec.candidates.len(), 1);
        assert!(rec.tool_calls.is_empty());
        assert_eq!(rec.text, text);
    }

    #[test]
    fn test_raw_newline_repair() {
        let text = "{'id': 'toolu_n', 'input': {'body': 'line one\nline two'}, 'name': 'write'}";
        let rec = recover(text);
        assert_eq!(rec.tool_calls[0].arguments["body"], "line one\nline two");
        assert_eq!(rec.text, "");
    }

    #[test]
    fn test_double_escaped_quote_repair() {
        let text = r"{'id': 'toolu_q', 'input': {'msg': 'don\\'t'}, 'name': 'say'}";
        let rec = recover(text);
        assert_eq!(rec.tool_calls.len(), 1, "{:?}", rec.candidates);
        assert_eq!(rec.tool_calls[0].arguments["msg"], "don't");
    }

    #[test]
    fn test_stray_closing_brace_repair() {
        let text = "go{'id': 'toolu_s', 'input': {'q': 'rust'}}, 'name': 'search', 'type': 'tool_use'} end";
        let rec = recover(text);
        assert_eq!(rec.tool_calls.len(), 1, "{:?}", rec.candidates);
        assert_eq!(rec.tool_calls[0].name, "search");
        assert_eq!(rec.text, "go end");
    }

    #[test]
    fn test_double_quoted_marker() {
        let text = r#"{"id": "toolu_d", "name": "ping", "input": null}"#;
        let rec = recover(text);
        assert_eq!(rec.tool_calls[0].id, "toolu_d");
        assert!(rec.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn test_no_marker_no_candidates() {
        assert!(!contains_leak("{'id': 'call_1', 'name': 'x'}"));
        assert!(find_candidates("plain text {with braces}").is_empty());
    }
}
