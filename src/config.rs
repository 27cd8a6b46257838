use crate::error::{BridgeError, Result};
use crate::translate::router::RouteTarget;
use crate::upstream::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.tokenfactory.nebius.com/v1";
const DEFAULT_TEXT_MODEL: &str = "zai-org/GLM-4.5";
const DEFAULT_VISION_MODEL: &str = "Qwen/Qwen2.5-VL-72B-Instruct";

/// Base URLs of well-known OpenAI-compatible providers, selectable by name.
const PROVIDER_PRESETS: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("fireworks", "https://api.fireworks.ai/inference/v1"),
    ("together", "https://api.together.xyz/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
    ("nebius", DEFAULT_BASE_URL),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub models: ModelTiers,
    #[serde(default)]
    pub limits: TokenLimits,
    #[serde(default)]
    pub vision: VisionConfig,
    /// Never declare tools upstream, for providers without function calling.
    #[serde(default)]
    pub disable_tools: bool,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub api_key_env: String,
    /// Extra headers sent with every upstream request.
    pub headers: HashMap<String, String>,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_secs: Option<u64>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTiers {
    pub big: String,
    /// Falls back to `big` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle: Option<String>,
    pub small: String,
    pub vision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLimits {
    pub max_tokens: u64,
    pub min_tokens: u64,
    pub context: ContextWindows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextWindows {
    pub default: u64,
    pub small: Option<u64>,
    pub middle: Option<u64>,
    pub big: Option<u64>,
    pub vision: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Drop the system prompt and shorten sibling text of image-bearing turns.
    pub strip_context: bool,
    /// Characters of sibling text kept per text block when stripping.
    pub text_limit: usize,
    /// Vision endpoints commonly reject tool use.
    pub drop_tools: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub path: PathBuf,
    pub max_size_mb: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8083
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: UpstreamConfig::default(),
            models: ModelTiers::default(),
            limits: TokenLimits::default(),
            vision: VisionConfig::default(),
            disable_tools: false,
            event_log: EventLogConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            provider: None,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            headers: HashMap::new(),
            timeout_secs: 90,
            stream_idle_timeout_secs: None,
            max_retries: 2,
            retry_backoff_ms: 500,
            retry_backoff_cap_ms: 8_000,
        }
    }
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            big: DEFAULT_TEXT_MODEL.to_string(),
            middle: None,
            small: DEFAULT_TEXT_MODEL.to_string(),
            vision: DEFAULT_VISION_MODEL.to_string(),
        }
    }
}

impl ModelTiers {
    pub fn middle(&self) -> &str {
        self.middle.as_deref().unwrap_or(&self.big)
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            min_tokens: 100,
            context: ContextWindows::default(),
        }
    }
}

impl TokenLimits {
    /// Context window of the model a request was routed to.
    pub fn context_window(&self, target: Option<RouteTarget>) -> u64 {
        let specific = match target {
            Some(RouteTarget::Small) => self.context.small,
            Some(RouteTarget::Middle) => self.context.middle,
            Some(RouteTarget::Big) => self.context.big,
            Some(RouteTarget::Vision) => self.context.vision,
            None => None,
        };
        specific.filter(|w| *w > 0).unwrap_or(self.context.default)
    }
}

impl Default for ContextWindows {
    fn default() -> Self {
        Self {
            default: 128_000,
            small: None,
            middle: None,
            big: None,
            vision: None,
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            strip_context: true,
            text_limit: 500,
            drop_tools: true,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("claude-bridge-events.log"),
            max_size_mb: 10,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.sanitize();
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults and environment");
        Ok(Self::default())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `KEY=value` overrides. Unparseable values are logged and ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value: String = value.into();
            match key {
                "OPENAI_BASE_URL" => self.upstream.base_url = Some(value),
                "HOST" => self.host = value,
                "PORT" => set_parsed(key, &value, &mut self.port),
                "BIG_MODEL" => self.models.big = value,
                "MIDDLE_MODEL" => self.models.middle = Some(value),
                "SMALL_MODEL" => self.models.small = value,
                "VISION_MODEL" => self.models.vision = value,
                "MAX_TOKENS_LIMIT" => set_parsed(key, &value, &mut self.limits.max_tokens),
                "MIN_TOKENS_LIMIT" => set_parsed(key, &value, &mut self.limits.min_tokens),
                "REQUEST_TIMEOUT" => set_parsed(key, &value, &mut self.upstream.timeout_secs),
                "STREAM_IDLE_TIMEOUT" => {
                    let mut secs = 0u64;
                    set_parsed(key, &value, &mut secs);
                    if secs > 0 {
                        self.upstream.stream_idle_timeout_secs = Some(secs);
                    }
                }
                "MAX_RETRIES" => set_parsed(key, &value, &mut self.upstream.max_retries),
                "STRIP_IMAGE_CONTEXT" => self.vision.strip_context = parse_flag(&value),
                "DISABLE_TOOLS" => self.disable_tools = parse_flag(&value),
                _ => {
                    if let Some(name) = key.strip_prefix("CUSTOM_HEADER_") {
                        if !name.is_empty() {
                            self.upstream.headers.insert(name.replace('_', "-"), value);
                        }
                    }
                }
            }
        }
        self.sanitize();
    }

    /// Keep token limits sane even with misconfigured values.
    pub fn sanitize(&mut self) {
        self.limits.max_tokens = self.limits.max_tokens.max(1);
        self.limits.min_tokens = self.limits.min_tokens.clamp(1, self.limits.max_tokens);
        if self.limits.context.default == 0 {
            self.limits.context.default = ContextWindows::default().default;
        }
    }

    /// Resolve the effective base URL (explicit override, provider preset, or default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.upstream.base_url {
            return Ok(url.clone());
        }

        match self.upstream.provider.as_deref() {
            None => Ok(DEFAULT_BASE_URL.to_string()),
            Some(name) => {
                let lowered = name.to_lowercase();
                PROVIDER_PRESETS
                    .iter()
                    .find(|(preset, _)| *preset == lowered)
                    .map(|(_, url)| (*url).to_string())
                    .ok_or_else(|| {
                        BridgeError::config(format!(
                            "Unknown provider '{}' and no base_url configured. Known providers: {}",
                            name,
                            PROVIDER_PRESETS
                                .iter()
                                .map(|(p, _)| *p)
                                .collect::<Vec<_>>()
                                .join(", ")
                        ))
                    })
            }
        }
    }

    /// Resolve the API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.upstream.api_key_env).map_err(|_| {
            BridgeError::config(format!(
                "Environment variable '{}' not set. Set it with your provider API key.",
                self.upstream.api_key_env
            ))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        self.upstream
            .stream_idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.request_timeout())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upstream.max_retries,
            base_backoff: Duration::from_millis(self.upstream.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.upstream.retry_backoff_cap_ms),
        }
    }
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value, "Ignoring unparseable environment override"),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("claude-bridge.toml"));

    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("claude-bridge")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("claude-bridge").join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("claude-bridge").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = home_dir() {
        paths.push(home.join(".claude-bridge.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
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

[upstream]
provider = "openrouter"
api_key_env = "OPENROUTER_API_KEY"
max_retries = 4

[upstream.headers]
"X-Title" = "bridge"

[models]
big = "big-model"
small = "small-model"
vision = "eye-model"

[limits]
max_tokens = 8192

[vision]
strip_context = false
"#
        )
        .unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.upstream.api_key_env, "OPENROUTER_API_KEY");
        assert_eq!(config.upstream.max_retries, 4);
        assert_eq!(config.upstream.timeout_secs, 90);
        assert_eq!(config.upstream.headers.get("X-Title"), Some(&"bridge".to_string()));
        assert_eq!(config.models.middle(), "big-model");
        assert_eq!(config.limits.max_tokens, 8192);
        assert_eq!(config.limits.min_tokens, 100);
        assert!(!config.vision.strip_context);
        assert_eq!(config.vision.text_limit, 500);
        assert_eq!(
            config.effective_base_url().unwrap(),
            "https://openrouter.ai/api/v1"
        );
    }

    #[test]
    fn test_defaults_without_file() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 8083);
        assert_eq!(config.effective_base_url().unwrap(), DEFAULT_BASE_URL);
        assert_eq!(config.models.middle(), DEFAULT_TEXT_MODEL);
        assert_eq!(config.request_timeout(), Duration::from_secs(90));
        assert_eq!(config.stream_idle_timeout(), config.request_timeout());
        assert!(config.vision.strip_context);
    }

    #[test]
    fn test_unknown_provider_without_base_url() {
        let mut config = BridgeConfig::default();
        config.upstream.provider = Some("nowhere".to_string());
        assert!(config.effective_base_url().is_err());

        config.upstream.base_url = Some("https://my-server.com/v1".to_string());
        assert_eq!(
            config.effective_base_url().unwrap(),
            "https://my-server.com/v1"
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config.apply_overrides([
            ("BIG_MODEL", "opus-backend"),
            ("MIDDLE_MODEL", "sonnet-backend"),
            ("SMALL_MODEL", "haiku-backend"),
            ("VISION_MODEL", "vl-backend"),
            ("MAX_TOKENS_LIMIT", "2048"),
            ("MIN_TOKENS_LIMIT", "64"),
            ("REQUEST_TIMEOUT", "30"),
            ("STREAM_IDLE_TIMEOUT", "15"),
            ("MAX_RETRIES", "5"),
            ("STRIP_IMAGE_CONTEXT", "no"),
            ("DISABLE_TOOLS", "YES"),
            ("PORT", "not-a-port"),
            ("CUSTOM_HEADER_X_ORG_ID", "acme"),
        ]);

        assert_eq!(config.models.big, "opus-backend");
        assert_eq!(config.models.middle(), "sonnet-backend");
        assert_eq!(config.models.small, "haiku-backend");
        assert_eq!(config.models.vision, "vl-backend");
        assert_eq!(config.limits.max_tokens, 2048);
        assert_eq!(config.limits.min_tokens, 64);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.stream_idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.upstream.max_retries, 5);
        assert!(!config.vision.strip_context);
        assert!(config.disable_tools);
        assert_eq!(config.port, 8083);
        assert_eq!(
            config.upstream.headers.get("X-ORG-ID"),
            Some(&"acme".to_string())
        );
    }

    #[test]
    fn test_sanitize_limits() {
        let mut config = BridgeConfig::default();
        config.apply_overrides([("MAX_TOKENS_LIMIT", "0"), ("MIN_TOKENS_LIMIT", "500")]);
        assert_eq!(config.limits.max_tokens, 1);
        assert_eq!(config.limits.min_tokens, 1);

        let mut config = BridgeConfig::default();
        config.apply_overrides([("MAX_TOKENS_LIMIT", "50"), ("MIN_TOKENS_LIMIT", "500")]);
        assert_eq!(config.limits.min_tokens, 50);
    }

    #[test]
    fn test_context_window_per_target() {
        let mut limits = TokenLimits::default();
        limits.context.vision = Some(32_000);
        assert_eq!(limits.context_window(Some(RouteTarget::Vision)), 32_000);
        assert_eq!(limits.context_window(Some(RouteTarget::Big)), 128_000);
        assert_eq!(limits.context_window(None), 128_000);
    }
}
