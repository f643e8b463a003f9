use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identity sent upstream as `user` on every request.
    pub user: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub leaked_tools: LeakedToolsConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    /// Extra `alias = "internal-id"` entries layered over the built-in table.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Native OpenAI-style SSE endpoint; enables real streaming of tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_stream_url: Option<String>,
    #[serde(default = "default_native_anthropic_url")]
    pub native_anthropic_url: String,
    /// Endpoint listing `{alias: internal-id}`; refreshed periodically when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_url: Option<String>,
    #[serde(default = "default_refresh_secs")]
    pub models_refresh_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Relay upstream text as it arrives instead of replaying a complete response.
    #[serde(default)]
    pub real_stream: bool,
    #[serde(default = "default_chunk_size")]
    pub pseudo_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakedToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Download `http(s)` image URLs and inline them as base64 data URLs.
    #[serde(default = "default_true")]
    pub inline_remote: bool,
    #[serde(default = "default_max_image_bytes")]
    pub max_bytes: usize,
}

fn default_port() -> u16 {
    44497
}

fn default_chat_url() -> String {
    "https://apps-dev.inside.anl.gov/argoapi/api/v1/resource/chat/".to_string()
}

fn default_stream_url() -> String {
    "https://apps-dev.inside.anl.gov/argoapi/api/v1/resource/streamchat/".to_string()
}

fn default_native_anthropic_url() -> String {
    "https://apps-dev.inside.anl.gov/argoapi/v1/messages".to_string()
}

fn default_refresh_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> f64 {
    600.0
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_image_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            chat_url: default_chat_url(),
            stream_url: default_stream_url(),
            openai_stream_url: None,
            native_anthropic_url: default_native_anthropic_url(),
            models_url: None,
            models_refresh_secs: default_refresh_secs(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            real_stream: false,
            pseudo_chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LeakedToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            inline_remote: true,
            max_bytes: default_max_image_bytes(),
        }
    }
}

impl GatewayConfig {
    /// A config with every default filled in, for the given upstream user.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            port: default_port(),
            user: user.into(),
            upstream: UpstreamConfig::default(),
            streaming: StreamingConfig::default(),
            leaked_tools: LeakedToolsConfig::default(),
            images: ImagesConfig::default(),
            models: HashMap::new(),
        }
    }

    /// Load config from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(GatewayError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// `ENABLE_LEAKED_TOOL_FIX` wins over the file setting when it parses.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("ENABLE_LEAKED_TOOL_FIX") {
            match parse_flag(&raw) {
                Some(enabled) => self.leaked_tools.enabled = enabled,
                None => tracing::warn!(value = %raw, "Ignoring unparseable ENABLE_LEAKED_TOOL_FIX"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(GatewayError::config("`user` must not be empty"));
        }
        if self.user.contains(char::is_whitespace) {
            return Err(GatewayError::config(format!(
                "`user` must not contain whitespace: '{}'",
                self.user
            )));
        }
        if self.streaming.pseudo_chunk_size == 0 {
            return Err(GatewayError::config("`streaming.pseudo_chunk_size` must be at least 1"));
        }
        if !(self.upstream.timeout_secs > 0.0
            && Duration::try_from_secs_f64(self.upstream.timeout_secs).is_ok())
        {
            return Err(GatewayError::config("`upstream.timeout_secs` must be a positive duration"));
        }
        for (name, url) in [
            ("chat_url", &self.upstream.chat_url),
            ("stream_url", &self.upstream.stream_url),
            ("native_anthropic_url", &self.upstream.native_anthropic_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GatewayError::config(format!(
                    "`upstream.{name}` must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("argo-gateway.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("argo-gateway").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("argo-gateway").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".argo-gateway.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000
user = "jdoe"

[upstream]
openai_stream_url = "http://localhost:9000/v1/chat/completions"
timeout_secs = 30

[streaming]
pseudo_chunk_size = 12

[models]
"argo:my-model" = "gpt4turbo"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.user, "jdoe");
        assert_eq!(config.upstream.timeout_secs, 30.0);
        assert_eq!(config.streaming.pseudo_chunk_size, 12);
        assert!(!config.streaming.real_stream);
        assert_eq!(
            config.models.get("argo:my-model"),
            Some(&"gpt4turbo".to_string())
        );
        assert!(config.upstream.chat_url.ends_with("/chat/"));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: GatewayConfig = toml::from_str(r#"user = "jdoe""#).unwrap();
        assert_eq!(config.port, 44497);
        assert!(config.leaked_tools.enabled);
        assert_eq!(config.streaming.pseudo_chunk_size, 30);
        assert!(config.upstream.openai_stream_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_user_rejected() {
        assert!(toml::from_str::<GatewayConfig>("port = 1").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::new("jdoe");
        config.streaming.pseudo_chunk_size = 0;
        assert!(matches!(config.validate(), Err(GatewayError::Config { .. })));

        let mut config = GatewayConfig::new("j doe");
        assert!(config.validate().is_err());
        config.user = "jdoe".to_string();
        config.upstream.chat_url = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::new("jdoe");
        config.upstream.timeout_secs = 1e300;
        assert!(matches!(config.validate(), Err(GatewayError::Config { .. })));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_search_paths_start_in_cwd() {
        let paths = config_search_paths();
        assert_eq!(paths[0], PathBuf::from("argo-gateway.toml"));
    }
}
