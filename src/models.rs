//! Model families and the alias registry.
//!
//! Clients address models by public aliases (`argo:gpt-4o`, `gpt-4o`,
//! `argo/claude-sonnet-4`). The upstream wants compact internal ids
//! (`gpt4o`, `claudesonnet4`). The registry resolves one into the other and
//! can be refreshed at runtime by swapping in a whole new snapshot.

use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Wire dialect the upstream speaks for a given backing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    OpenAi,
    Anthropic,
    Google,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Whether the upstream can stream tool-call fragments for this family.
    pub fn supports_streamed_tool_calls(self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a model name (alias or internal id) into its family.
pub fn family_of(model: &str) -> ModelFamily {
    let lower = model.to_ascii_lowercase();
    if lower.contains("claude") {
        ModelFamily::Anthropic
    } else if lower.contains("gemini") || lower.contains("bison") || lower.contains("palm") {
        ModelFamily::Google
    } else {
        ModelFamily::OpenAi
    }
}

const DEFAULT_MODEL: &str = "gpt4o";

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("argo:gpt-35-turbo", "gpt35"),
    ("argo:gpt-4", "gpt4"),
    ("argo:gpt-4-turbo", "gpt4turbo"),
    ("argo:gpt-4o", "gpt4o"),
    ("argo:gpt-4o-mini", "gpt4omini"),
    ("argo:gpt-4.1", "gpt41"),
    ("argo:gpt-4.1-mini", "gpt41mini"),
    ("argo:gpt-o1", "gpto1"),
    ("argo:gpt-o3", "gpto3"),
    ("argo:gpt-o3-mini", "gpto3mini"),
    ("argo:gpt-o4-mini", "gpto4mini"),
    ("argo:gpt-5", "gpt5"),
    ("argo:gemini-2.5-pro", "gemini25pro"),
    ("argo:gemini-2.5-flash", "gemini25flash"),
    ("argo:claude-opus-4", "claudeopus4"),
    ("argo:claude-opus-4.1", "claudeopus41"),
    ("argo:claude-sonnet-4", "claudesonnet4"),
    ("argo:claude-sonnet-4.5", "claudesonnet45"),
    ("argo:claude-sonnet-3.7", "claudesonnet37"),
    ("argo:claude-haiku-4.5", "claudehaiku45"),
];

pub fn builtin_aliases() -> HashMap<String, String> {
    BUILTIN_ALIASES
        .iter()
        .map(|(alias, id)| ((*alias).to_string(), (*id).to_string()))
        .collect()
}

/// Immutable view of the alias table. Never mutated once published.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    aliases: HashMap<String, String>,
    default_model: String,
}

impl RegistrySnapshot {
    pub fn new(aliases: HashMap<String, String>, default_model: impl Into<String>) -> Self {
        Self {
            aliases,
            default_model: default_model.into(),
        }
    }

    /// Resolve a client-supplied name into an upstream internal id.
    ///
    /// Tries, in order: the name itself, with `/` read as `:`, lowercased, and
    /// with an `argo:` prefix added. Each candidate matches an alias key or
    /// an internal id directly. Unknown names fall back to the default.
    pub fn resolve(&self, requested: &str) -> String {
        for candidate in resolution_candidates(requested) {
            if let Some(id) = self.aliases.get(&candidate) {
                return id.clone();
            }
            if self.aliases.values().any(|id| *id == candidate) {
                return candidate;
            }
        }

        tracing::debug!(model = requested, fallback = %self.default_model, "Unknown model, using default");
        self.default_model.clone()
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&String, &String)> {
        self.aliases.iter()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

fn resolution_candidates(requested: &str) -> Vec<String> {
    let original = requested.trim().to_string();
    let colon = original.replace('/', ":");
    let lower = colon.to_lowercase();
    let prefixed = if lower.starts_with("argo:") {
        lower.clone()
    } else {
        format!("argo:{lower}")
    };

    let mut out: Vec<String> = Vec::with_capacity(4);
    for c in [original, colon, lower, prefixed] {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

/// Shared handle to the current snapshot. Readers clone the `Arc` and work on
/// a stable view, refreshes replace it wholesale.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    current: Arc<RwLock<Arc<RegistrySnapshot>>>,
    overrides: Arc<HashMap<String, String>>,
}

impl ModelRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
            overrides: Arc::new(HashMap::new()),
        }
    }

    /// Built-in aliases with `overrides` layered on top. Overrides also win
    /// over anything a later refresh fetches.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let snapshot = RegistrySnapshot::new(merge_aliases(&HashMap::new(), overrides), DEFAULT_MODEL);
        Self {
            overrides: Arc::new(overrides.clone()),
            ..Self::new(snapshot)
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn replace(&self, snapshot: RegistrySnapshot) {
        let next = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn resolve(&self, requested: &str) -> String {
        self.snapshot().resolve(requested)
    }

    /// Fetch an alias table (`{"alias": "internal_id", ...}`) from `url` and
    /// publish it between the built-ins and the configured overrides.
    pub async fn refresh_from(&self, client: &reqwest::Client, url: &str) -> Result<usize> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::transport(format!("Failed to fetch model list: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream { status, body });
        }

        let fetched: HashMap<String, String> = response
            .json()
            .await
            .map_err(|e| GatewayError::transport(format!("Failed to parse model list: {e}")))?;

        let merged = merge_aliases(&fetched, &self.overrides);
        let count = merged.len();
        self.replace(RegistrySnapshot::new(merged, DEFAULT_MODEL));
        tracing::info!(models = count, "Model registry refreshed");
        Ok(count)
    }
}

fn merge_aliases(
    fetched: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut aliases = builtin_aliases();
    for (alias, id) in fetched.iter().chain(overrides.iter()) {
        aliases.insert(alias.clone(), id.clone());
    }
    aliases
}
