use crate::error::{GatewayError, Result};
use crate::models::{family_of, ModelFamily};
use crate::server::AppState;
use crate::tool_calls::{self, Normalized, NormalizerContext};
use crate::translate::anthropic_types::{MessagesRequest, Metadata};
use crate::translate::canonical::{CanonicalRequest, UsageRecord};
use crate::translate::decoder::Utf8Decoder;
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionResponse};
use crate::translate::request::{from_provider, to_provider};
use crate::translate::response::{response_from_provider, to_chat_completion};
use crate::translate::streaming::{select_mode, RealSource, SseFrame, StreamMode, StreamReconstructor};
use crate::translate::upstream_types::ProviderRequest;
use crate::usage::TokenCounter;

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Outcome of a streaming chat completion: SSE payloads in order, ending
/// with [`SseFrame::Done`]. An `Err` item aborts the response body.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// A client request resolved against the registry and ready to dispatch.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub canonical: CanonicalRequest,
    /// Model string as the client sent it; echoed back in responses.
    pub requested_model: String,
    pub family: ModelFamily,
    pub mode: StreamMode,
    pub timeout_secs: f64,
}

/// Decode an OpenAI chat-completion body and resolve everything the upstream
/// call needs: internal model id, family, user, inlined images, timeout and
/// stream mode.
pub async fn prepare(state: &AppState, payload: &Value) -> Result<PreparedRequest> {
    let decoded = from_provider(payload, ModelFamily::OpenAi)?;
    let mut warnings = decoded.warnings;
    let mut canonical = decoded.value;

    let requested_model = canonical.model.clone();
    canonical.model = state.registry.resolve(&requested_model);
    let family = family_of(&canonical.model);
    canonical.user = Some(state.config.user.clone());

    warnings.extend(state.images.inline_request(&mut canonical).await);

    let timeout_secs = match canonical.timeout {
        Some(t) if t > 0.0 && Duration::try_from_secs_f64(t).is_ok() => t,
        Some(t) if t.is_finite() && t > 0.0 => {
            return Err(GatewayError::decode(
                ModelFamily::OpenAi,
                "timeout",
                format!("{t} seconds is out of range"),
            ));
        }
        _ => state.config.upstream.timeout_secs,
    };
    let mode = select_mode(&canonical, family, &state.config);

    for w in &warnings {
        tracing::warn!(model = %canonical.model, warning = %w, "Lossy request decoding");
    }
    tracing::info!(
        requested = %requested_model,
        model = %canonical.model,
        family = %family,
        mode = ?mode,
        messages = canonical.messages.len(),
        tools = canonical.tools.len(),
        "Chat completion request"
    );

    Ok(PreparedRequest {
        canonical,
        requested_model,
        family,
        mode,
        timeout_secs,
    })
}

/// Fetch the complete upstream answer and return it as one chat completion.
pub async fn proxy_non_streaming(
    state: &AppState,
    prepared: &PreparedRequest,
) -> Result<ChatCompletionResponse> {
    let normalized = fetch_normalized(state, prepared).await?;
    let usage = state
        .tokens
        .usage(&prepared.canonical, &normalized.text, &normalized.tool_calls);

    tracing::info!(
        model = %prepared.canonical.model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        tool_calls = normalized.tool_calls.len(),
        "Completed"
    );

    Ok(to_chat_completion(
        &format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        chrono::Utc::now().timestamp(),
        &prepared.requested_model,
        &normalized.text,
        &normalized.tool_calls,
        usage,
    ))
}

/// Start a streamed chat completion in the request's stream mode.
pub async fn proxy_streaming(state: &AppState, prepared: &PreparedRequest) -> Result<SseStream> {
    let rec = StreamReconstructor::new(&prepared.requested_model);

    let source = match prepared.mode {
        StreamMode::NonStreaming | StreamMode::Pseudo => {
            let normalized = fetch_normalized(state, prepared).await?;
            let usage = state
                .tokens
                .usage(&prepared.canonical, &normalized.text, &normalized.tool_calls);
            return Ok(pseudo_frames(
                rec,
                &normalized,
                state.config.streaming.pseudo_chunk_size,
                usage,
            ));
        }
        StreamMode::Real(source) => source,
    };

    let url = match source {
        RealSource::RawText => state.config.upstream.stream_url.as_str(),
        RealSource::OpenAiSse => state
            .config
            .upstream
            .openai_stream_url
            .as_deref()
            .ok_or_else(|| GatewayError::config("`upstream.openai_stream_url` is not set"))?,
    };

    let mut body = provider_request(prepared);
    body.set_stream(true);
    let response = send(&state.client, url, &body, prepared.timeout_secs).await?;

    let accounting = StreamAccounting::new(state.tokens.clone(), &prepared.canonical);
    let frames = match source {
        RealSource::RawText => raw_text_frames(response, rec, accounting, prepared.timeout_secs),
        RealSource::OpenAiSse => openai_sse_frames(response, rec, accounting, prepared.timeout_secs),
    };
    Ok(frames)
}

fn provider_request(prepared: &PreparedRequest) -> ProviderRequest {
    let translated = to_provider(&prepared.canonical, prepared.family);
    translated.value
}

/// Non-streaming upstream call, decoded and run through the normalizer.
async fn fetch_normalized(state: &AppState, prepared: &PreparedRequest) -> Result<Normalized> {
    let mut body = provider_request(prepared);
    body.set_stream(false);
    let raw = complete(
        &state.client,
        &state.config.upstream.chat_url,
        &body,
        prepared.timeout_secs,
    )
    .await?;

    let mut warnings = Vec::new();
    let response = response_from_provider(&raw, prepared.family, &mut warnings)?;
    for w in &warnings {
        tracing::warn!(model = %prepared.canonical.model, warning = %w, "Lossy response translation");
    }

    let ctx = NormalizerContext::new(&prepared.canonical.model, state.config.leaked_tools.enabled)
        .with_sink(state.diagnostics.as_ref())
        .with_raw_response(&raw);
    Ok(tool_calls::process(
        &response.text,
        response.tool_calls,
        prepared.family,
        &ctx,
    ))
}

/// POST `body` and check the status. Non-2xx answers become
/// [`GatewayError::Upstream`] carrying the body verbatim.
async fn send(
    client: &reqwest::Client,
    url: &str,
    body: &ProviderRequest,
    timeout_secs: f64,
) -> Result<reqwest::Response> {
    tracing::info!(url, model = body.model(), "POST upstream");
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .map_err(|e| GatewayError::config(format!("invalid timeout {timeout_secs}: {e}")))?;

    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| GatewayError::from_reqwest(e, timeout_secs))?;

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status, body = %truncate(&body, 300), "Upstream error");
        return Err(GatewayError::Upstream { status, body });
    }
    Ok(response)
}

/// One complete upstream call, returning the decoded JSON envelope.
pub async fn complete(
    client: &reqwest::Client,
    url: &str,
    body: &ProviderRequest,
    timeout_secs: f64,
) -> Result<Value> {
    let response = send(client, url, body, timeout_secs).await?;
    let text = response
        .text()
        .await
        .map_err(|e| GatewayError::from_reqwest(e, timeout_secs))?;

    tracing::debug!(body_len = text.len(), "Upstream response");

    serde_json::from_str(&text).map_err(|e| {
        GatewayError::transport(format!(
            "Upstream returned a non-JSON body: {}. Body: {}",
            e,
            truncate(&text, 300)
        ))
    })
}

/// Computes the usage chunk of a real stream from what was relayed.
pub struct StreamAccounting {
    counter: TokenCounter,
    model: String,
    prompt_tokens: u64,
}

impl StreamAccounting {
    pub fn new(counter: TokenCounter, req: &CanonicalRequest) -> Self {
        Self {
            prompt_tokens: counter.prompt_tokens(req),
            model: req.model.clone(),
            counter,
        }
    }

    fn usage(&self, rec: &StreamReconstructor) -> UsageRecord {
        let completion = self
            .counter
            .completion_tokens(&self.model, rec.text(), &rec.tool_calls());
        UsageRecord::new(self.prompt_tokens, completion)
    }
}

fn chunk_frames(chunks: Vec<ChatCompletionChunk>) -> impl Iterator<Item = Result<SseFrame>> {
    chunks.into_iter().map(|c| Ok(SseFrame::Chunk(c)))
}

/// Replay a complete, normalized response as a chunk stream.
pub fn pseudo_frames(
    mut rec: StreamReconstructor,
    normalized: &Normalized,
    chunk_size: usize,
    usage: UsageRecord,
) -> SseStream {
    let mut chunks = rec.pseudo_chunks(&normalized.text, &normalized.tool_calls, chunk_size);
    chunks.extend(rec.finish(usage));

    let frames: Vec<Result<SseFrame>> = chunk_frames(chunks)
        .chain(std::iter::once(Ok(SseFrame::Done)))
        .collect();
    Box::pin(stream::iter(frames))
}

/// Relay a raw UTF-8 text body as content deltas.
pub fn raw_text_frames(
    response: reqwest::Response,
    rec: StreamReconstructor,
    accounting: StreamAccounting,
    timeout_secs: f64,
) -> SseStream {
    Box::pin(raw_text_stream(response.bytes_stream(), rec, accounting, timeout_secs))
}

fn raw_text_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    mut rec: StreamReconstructor,
    accounting: StreamAccounting,
    timeout_secs: f64,
) -> impl Stream<Item = Result<SseFrame>> + Send + 'static {
    async_stream::stream! {
        let mut decoder = Utf8Decoder::new();

        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(id = rec.id(), error = %e, "Upstream stream failed");
                    yield Err(GatewayError::from_reqwest(e, timeout_secs));
                    return;
                }
            };

            let text = decoder.decode(&chunk);
            if let Some(delta) = rec.text_delta(&text) {
                yield Ok(SseFrame::Chunk(delta));
            }
        }

        let tail = decoder.flush();
        if let Some(delta) = rec.text_delta(&tail) {
            yield Ok(SseFrame::Chunk(delta));
        }

        let usage = accounting.usage(&rec);
        for frame in chunk_frames(rec.finish(usage)) {
            yield frame;
        }
        yield Ok(SseFrame::Done);

        tracing::info!(id = rec.id(), "Stream completed");
    }
}

/// Relay an upstream OpenAI SSE stream chunk by chunk, tool-call fragments
/// included.
pub fn openai_sse_frames(
    response: reqwest::Response,
    rec: StreamReconstructor,
    accounting: StreamAccounting,
    timeout_secs: f64,
) -> SseStream {
    Box::pin(openai_sse_stream(response.bytes_stream(), rec, accounting, timeout_secs))
}

fn openai_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    mut rec: StreamReconstructor,
    accounting: StreamAccounting,
    timeout_secs: f64,
) -> impl Stream<Item = Result<SseFrame>> + Send + 'static {
    async_stream::stream! {
        let events = byte_stream.eventsource();
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(ev) => ev,
                Err(EventStreamError::Transport(e)) => {
                    tracing::error!(id = rec.id(), error = %e, "Upstream stream failed");
                    yield Err(GatewayError::from_reqwest(e, timeout_secs));
                    return;
                }
                Err(e) => {
                    tracing::error!(id = rec.id(), error = %e, "Malformed upstream event stream");
                    yield Err(GatewayError::transport(e.to_string()));
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unparseable chunk");
                    continue;
                }
            };

            if let Some(relayed) = rec.relay_chunk(chunk) {
                yield Ok(SseFrame::Chunk(relayed));
            }
        }

        // Close the stream properly even if [DONE] was missing
        let usage = accounting.usage(&rec);
        for frame in chunk_frames(rec.finish(usage)) {
            yield frame;
        }
        yield Ok(SseFrame::Done);

        tracing::info!(id = rec.id(), "Stream completed");
    }
}

/// Headers a native Anthropic client sends that the upstream understands.
const FORWARDED_HEADERS: [&str; 2] = ["anthropic-version", "anthropic-beta"];

/// Forward an Anthropic Messages request to the native endpoint. The model
/// alias is resolved and the configured user is stamped on; the response is
/// returned untouched for the caller to relay.
pub async fn proxy_passthrough(
    state: &AppState,
    body: &[u8],
    headers: &reqwest::header::HeaderMap,
) -> Result<reqwest::Response> {
    let mut req: MessagesRequest = serde_json::from_slice(body)?;
    req.model = state.registry.resolve(&req.model);

    let metadata = req.metadata.get_or_insert_with(|| Metadata {
        user_id: None,
        extra: Default::default(),
    });
    metadata.user_id = Some(state.config.user.clone());
    req.extra
        .insert("user".to_string(), Value::String(state.config.user.clone()));

    let url = &state.config.upstream.native_anthropic_url;
    let timeout_secs = state.config.upstream.timeout_secs;
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .map_err(|e| GatewayError::config(format!("invalid timeout {timeout_secs}: {e}")))?;
    tracing::info!(url = %url, model = %req.model, stream = req.stream.unwrap_or(false), "Passthrough POST");

    let mut builder = state
        .client
        .post(url)
        .header("Content-Type", "application/json")
        .timeout(timeout);
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(name) {
            builder = builder.header(name, value);
        }
    }

    let response = builder
        .json(&req)
        .send()
        .await
        .map_err(|e| GatewayError::from_reqwest(e, timeout_secs))?;

    tracing::info!(status = response.status().as_u16(), "Passthrough response");
    Ok(response)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{ChatMessage, Role, ToolCall};
    use serde_json::Map;
    use std::sync::OnceLock;

    fn counter() -> &'static TokenCounter {
        static COUNTER: OnceLock<TokenCounter> = OnceLock::new();
        COUNTER.get_or_init(|| TokenCounter::new().unwrap())
    }

    fn accounting() -> StreamAccounting {
        let req = CanonicalRequest::new("gpt4o", vec![ChatMessage::text(Role::User, "hi")]);
        StreamAccounting::new(counter().clone(), &req)
    }

    fn bytes_of(parts: &[&[u8]]) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static {
        let owned: Vec<std::result::Result<Bytes, reqwest::Error>> =
            parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect();
        stream::iter(owned)
    }

    fn chunks(frames: &[Result<SseFrame>]) -> Vec<&ChatCompletionChunk> {
        frames
            .iter()
            .filter_map(|f| match f {
                Ok(SseFrame::Chunk(c)) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[tokio::test]
    async fn test_raw_text_split_codepoint() {
        // "é" is 0xC3 0xA9, split across two reads
        let input = bytes_of(&[&b"caf\xC3"[..], &b"\xA9 ok"[..]]);
        let frames: Vec<_> = raw_text_stream(input, StreamReconstructor::new("gpt4o"), accounting(), 10.0)
            .collect()
            .await;

        let content: String = chunks(&frames)
            .iter()
            .filter_map(|c| c.choices.first())
            .filter_map(|c| c.delta.content.clone())
            .collect();
        assert_eq!(content, "café ok");
        assert!(matches!(frames.last(), Some(Ok(SseFrame::Done))));

        let usage_chunk = chunks(&frames).last().copied().unwrap();
        assert!(usage_chunk.choices.is_empty());
        assert!(usage_chunk.usage.as_ref().unwrap().completion_tokens > 0);
    }

    #[tokio::test]
    async fn test_openai_sse_relays_and_terminates_once() {
        let body = concat!(
            "data: {\"id\":\"up\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"x\",",
            "\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"up\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"x\",",
            "\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let rec = StreamReconstructor::new("argo:gpt-4o");
        let id = rec.id().to_string();
        let frames: Vec<_> = openai_sse_stream(bytes_of(&[body.as_bytes()]), rec, accounting(), 10.0)
            .collect()
            .await;

        let all = chunks(&frames);
        assert!(all.iter().all(|c| c.id == id));
        let terminal: Vec<_> = all
            .iter()
            .filter_map(|c| c.choices.first())
            .filter_map(|c| c.finish_reason.clone())
            .collect();
        assert_eq!(terminal, vec!["length".to_string()]);
        assert!(matches!(frames.last(), Some(Ok(SseFrame::Done))));
    }

    #[tokio::test]
    async fn test_pseudo_frames_end_with_usage_and_done() {
        let normalized = Normalized {
            tool_calls: vec![ToolCall::new("toolu_1", "bash", Map::new())],
            text: "Let me check:".to_string(),
        };
        let frames: Vec<_> = pseudo_frames(
            StreamReconstructor::new("claudesonnet4"),
            &normalized,
            30,
            UsageRecord::new(5, 7),
        )
        .collect()
        .await;

        // content, tool call, terminal, usage, [DONE]
        assert_eq!(frames.len(), 5);
        let all = chunks(&frames);
        assert_eq!(all[2].choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(all[3].usage.as_ref().unwrap().total_tokens, 12);
        assert!(matches!(frames[4], Ok(SseFrame::Done)));
    }
}
