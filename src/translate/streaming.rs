//! Reconstructing an OpenAI chunk stream from upstream output.
//!
//! The [`StreamReconstructor`] owns the chunk sequence for one response. It
//! hands out chunks that share a single `chatcmpl-` id, puts the assistant
//! role on the first one only, and guarantees exactly one terminal chunk
//! followed by the usage chunk.
//!
//! Usage:
//!   let mut rec = StreamReconstructor::new("gpt4o");
//!   let mut chunks = rec.pseudo_chunks(&text, &calls, 30);
//!   chunks.extend(rec.finish(usage));
//!   // send each chunk as `data: {json}`, then `data: [DONE]`

use super::canonical::{CanonicalRequest, FinishReason, ToolCall, UsageRecord};
use super::openai::{encode_tool_call, parse_arguments};
use super::openai_types::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use super::response::usage_to_wire;
use crate::config::GatewayConfig;
use crate::models::ModelFamily;

/// Where streamed content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    NonStreaming,
    /// Fetch the complete response, normalize it, then replay it as chunks.
    Pseudo,
    Real(RealSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealSource {
    /// Raw UTF-8 text body, relayed as content deltas.
    RawText,
    /// OpenAI SSE, relayed chunk by chunk including tool-call fragments.
    OpenAiSse,
}

pub fn select_mode(req: &CanonicalRequest, family: ModelFamily, config: &GatewayConfig) -> StreamMode {
    if !req.stream {
        return StreamMode::NonStreaming;
    }
    if req.has_tools() {
        if family.supports_streamed_tool_calls() && config.upstream.openai_stream_url.is_some() {
            return StreamMode::Real(RealSource::OpenAiSse);
        }
        return StreamMode::Pseudo;
    }
    if config.streaming.real_stream {
        StreamMode::Real(RealSource::RawText)
    } else {
        StreamMode::Pseudo
    }
}

/// One SSE `data:` payload.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

impl SseFrame {
    pub fn data(&self) -> String {
        match self {
            // Chunks are plain data structs; serialization cannot fail.
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Done => "[DONE]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Streaming,
    Terminated,
}

/// A tool call assembled from streamed fragments.
#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
pub struct StreamReconstructor {
    id: String,
    created: i64,
    model: String,
    phase: Phase,
    text: String,
    tool_calls: Vec<PartialToolCall>,
    upstream_finish: Option<FinishReason>,
}

impl StreamReconstructor {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            phase: Phase::Init,
            text: String::new(),
            tool_calls: Vec::new(),
            upstream_finish: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Everything emitted as content so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tool calls seen so far, with fragmented arguments joined and parsed.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .iter()
            .map(|c| {
                let (arguments, _) = parse_arguments(&c.arguments);
                ToolCall::new(c.id.clone(), c.name.clone(), arguments)
            })
            .collect()
    }

    /// A content delta. Empty text produces nothing.
    pub fn text_delta(&mut self, text: &str) -> Option<ChatCompletionChunk> {
        if text.is_empty() || self.is_terminated() {
            return None;
        }
        self.text.push_str(text);
        Some(self.chunk(
            ChunkDelta {
                content: Some(text.to_string()),
                ..Default::default()
            },
            None,
        ))
    }

    /// A complete tool call as a single chunk.
    pub fn tool_call(&mut self, call: &ToolCall) -> Option<ChatCompletionChunk> {
        if self.is_terminated() {
            return None;
        }
        let index = self.tool_calls.len() as u64;
        self.tool_calls.push(PartialToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments_json(),
        });
        let wire = encode_tool_call(call);
        Some(self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![ChunkToolCall {
                    index,
                    id: Some(wire.id),
                    call_type: Some(wire.call_type),
                    function: Some(ChunkToolCallFunction {
                        name: Some(wire.function.name),
                        arguments: Some(wire.function.arguments),
                    }),
                }]),
                ..Default::default()
            },
            None,
        ))
    }

    /// Re-stamp an upstream OpenAI chunk with this stream's identity.
    ///
    /// Content and tool-call fragments pass through unchanged. The upstream
    /// finish reason is held back for [`finish`](Self::finish), and upstream
    /// usage is dropped since usage is computed locally.
    pub fn relay_chunk(&mut self, upstream: ChatCompletionChunk) -> Option<ChatCompletionChunk> {
        if self.is_terminated() {
            return None;
        }

        let choice = upstream.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.upstream_finish = Some(FinishReason::parse(reason));
        }

        let content = choice.delta.content.filter(|c| !c.is_empty());
        let fragments = choice
            .delta
            .tool_calls
            .map(|mut t| {
                t.retain(|fragment| self.absorb_fragment(fragment));
                t
            })
            .filter(|t| !t.is_empty());
        if content.is_none() && fragments.is_none() {
            return None;
        }

        if let Some(text) = &content {
            self.text.push_str(text);
        }

        Some(self.chunk(
            ChunkDelta {
                content,
                tool_calls: fragments,
                ..Default::default()
            },
            None,
        ))
    }

    /// Slice a complete response into content chunks of `chunk_size`
    /// characters, followed by one chunk per tool call.
    pub fn pseudo_chunks(
        &mut self,
        text: &str,
        calls: &[ToolCall],
        chunk_size: usize,
    ) -> Vec<ChatCompletionChunk> {
        let size = chunk_size.max(1);
        let mut out = Vec::new();

        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(size) {
            let piece: String = piece.iter().collect();
            out.extend(self.text_delta(&piece));
        }
        for call in calls {
            out.extend(self.tool_call(call));
        }
        out
    }

    /// The terminal chunk and the usage chunk. Calling again yields nothing.
    pub fn finish(&mut self, usage: UsageRecord) -> Vec<ChatCompletionChunk> {
        if self.is_terminated() {
            return Vec::new();
        }

        let reason = if !self.tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            self.upstream_finish.unwrap_or(FinishReason::Stop)
        };

        let terminal = self.chunk(ChunkDelta::default(), Some(reason));
        self.phase = Phase::Terminated;

        let usage_chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: Some(usage_to_wire(usage)),
        };

        vec![terminal, usage_chunk]
    }

    /// Fold one tool-call fragment into its slot. Indices must extend the
    /// list by at most one; anything further out is dropped.
    fn absorb_fragment(&mut self, fragment: &ChunkToolCall) -> bool {
        let known = self.tool_calls.len();
        let index = match usize::try_from(fragment.index) {
            Ok(i) if i <= known => i,
            _ => {
                tracing::warn!(index = fragment.index, known, "Dropping out-of-order tool call fragment");
                return false;
            }
        };
        if index == known {
            self.tool_calls.push(PartialToolCall::default());
        }
        let slot = &mut self.tool_calls[index];
        if let Some(id) = &fragment.id {
            slot.id.clone_from(id);
        }
        if let Some(function) = &fragment.function {
            if let Some(name) = &function.name {
                slot.name.push_str(name);
            }
            if let Some(args) = &function.arguments {
                slot.arguments.push_str(args);
            }
        }
        true
    }

    fn chunk(&mut self, mut delta: ChunkDelta, finish: Option<FinishReason>) -> ChatCompletionChunk {
        if self.phase == Phase::Init {
            delta.role = Some("assistant".to_string());
            self.phase = Phase::Streaming;
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(|f| f.as_str().to_string()),
            }],
            usage: None,
        }
    }
}
