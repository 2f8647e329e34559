//! Relay configuration: optional TOML file, then environment overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "wa-relay.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "openai/gpt-5.2".to_string()
}

fn default_llm_base_url() -> String {
    wa_llm::DEFAULT_BASE_URL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_llm_base_url(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Evolution API base URL, e.g. `https://evo.example.com`.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub instance: String,
    /// When set, webhook payloads must carry this value in their `apikey` field.
    #[serde(default)]
    pub webhook_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    /// Number of most recent thread turns sent to the model.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_debounce_seconds() -> u64 {
    10
}

fn default_history_limit() -> usize {
    40
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            history_limit: default_history_limit(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
    #[serde(default = "default_typing_min_ms")]
    pub typing_min_ms: u64,
    #[serde(default = "default_typing_max_ms")]
    pub typing_max_ms: u64,
    #[serde(default = "default_typing_pulse_ms")]
    pub typing_pulse_ms: u64,
    #[serde(default = "default_pause_min_ms")]
    pub pause_min_ms: u64,
    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,
    #[serde(default = "default_mark_read")]
    pub mark_read: bool,
}

fn default_delimiter() -> String {
    "|||".to_string()
}

fn default_typing_ms_per_char() -> u64 {
    50
}

fn default_typing_min_ms() -> u64 {
    2_000
}

fn default_typing_max_ms() -> u64 {
    60_000
}

fn default_typing_pulse_ms() -> u64 {
    3_000
}

fn default_pause_min_ms() -> u64 {
    500
}

fn default_pause_max_ms() -> u64 {
    1_500
}

fn default_mark_read() -> bool {
    true
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            typing_ms_per_char: default_typing_ms_per_char(),
            typing_min_ms: default_typing_min_ms(),
            typing_max_ms: default_typing_max_ms(),
            typing_pulse_ms: default_typing_pulse_ms(),
            pause_min_ms: default_pause_min_ms(),
            pause_max_ms: default_pause_max_ms(),
            mark_read: default_mark_read(),
        }
    }
}

impl RelayConfig {
    /// Load config from `path` (or `./wa-relay.toml`), apply env overrides, validate.
    ///
    /// An explicit path must exist; the default path is optional.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    /// Like `load`, also returning the file that was read, if any.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let (mut cfg, path) = Self::read(path).await?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    async fn read(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok((Self::default(), None));
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };
        let cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        Ok((cfg, Some(path)))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub(crate) fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("OPENROUTER_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("OPENROUTER_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("EVOLUTION_API_URL") {
            self.gateway.api_url = v;
        }
        if let Some(v) = get("EVOLUTION_API_KEY") {
            self.gateway.api_key = v;
        }
        if let Some(v) = get("EVOLUTION_INSTANCE") {
            self.gateway.instance = v;
        }
        if let Some(v) = get("EVOLUTION_WEBHOOK_API_KEY") {
            self.gateway.webhook_api_key = Some(v);
        }
        if let Some(v) = get("DEBOUNCE_SECONDS") {
            match v.trim().parse() {
                Ok(secs) => self.agent.debounce_seconds = secs,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring invalid DEBOUNCE_SECONDS"),
            }
        }
        if let Some(v) = get("WA_RELAY_BIND_ADDR") {
            self.server.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.database.url.trim().is_empty() {
            return Err(anyhow::anyhow!("database.url (DATABASE_URL) is required"));
        }
        if self.database.max_connections < 2 {
            return Err(anyhow::anyhow!(
                "database.max_connections must be >= 2 (each running chat pass holds one)"
            ));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.api_key (OPENROUTER_API_KEY) is required"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.gateway.api_url.trim().is_empty() {
            return Err(anyhow::anyhow!("gateway.api_url (EVOLUTION_API_URL) is required"));
        }
        if self.gateway.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("gateway.api_key (EVOLUTION_API_KEY) is required"));
        }
        if self.gateway.instance.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "gateway.instance (EVOLUTION_INSTANCE) is required"
            ));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        let d = &self.delivery;
        if d.delimiter.is_empty() {
            return Err(anyhow::anyhow!("delivery.delimiter must not be empty"));
        }
        if d.typing_min_ms > d.typing_max_ms {
            return Err(anyhow::anyhow!(
                "delivery.typing_min_ms must be <= delivery.typing_max_ms"
            ));
        }
        if d.typing_pulse_ms == 0 {
            return Err(anyhow::anyhow!("delivery.typing_pulse_ms must be > 0"));
        }
        if d.pause_min_ms > d.pause_max_ms {
            return Err(anyhow::anyhow!(
                "delivery.pause_min_ms must be <= delivery.pause_max_ms"
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.agent.debounce_seconds)
    }

    /// Chat passes allowed to run at once.
    ///
    /// Every running pass pins one pooled connection for its chat lock, so one
    /// connection is always left over for short queries and webhook inserts.
    pub fn max_concurrent_passes(&self) -> usize {
        (self.database.max_connections as usize).saturating_sub(1).max(1)
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(".").join(DEFAULT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn complete() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.database.url = "postgres://localhost/relay".to_string();
        cfg.llm.api_key = "sk-or".to_string();
        cfg.gateway.api_url = "https://evo.test".to_string();
        cfg.gateway.api_key = "evo-key".to_string();
        cfg.gateway.instance = "main".to_string();
        cfg
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.agent.debounce_seconds, 10);
        assert_eq!(cfg.delivery.delimiter, "|||");
        assert_eq!(cfg.delivery.typing_min_ms, 2_000);
        assert_eq!(cfg.delivery.typing_max_ms, 60_000);
        assert_eq!(cfg.llm.model, "openai/gpt-5.2");
        assert_eq!(cfg.llm.base_url, wa_llm::DEFAULT_BASE_URL);
        assert!(cfg.delivery.mark_read);
    }

    #[test]
    fn parse_fills_missing_sections_with_defaults() {
        let cfg = RelayConfig::parse(
            r#"
[database]
url = "postgres://db/relay"

[agent]
debounce_seconds = 4

[delivery]
delimiter = "~~"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.database.url, "postgres://db/relay");
        assert_eq!(cfg.database.max_connections, 10);
        assert_eq!(cfg.agent.debounce_seconds, 4);
        assert_eq!(cfg.agent.history_limit, 40);
        assert_eq!(cfg.delivery.delimiter, "~~");
        assert_eq!(cfg.delivery.pause_max_ms, 1_500);
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://env/relay"),
            ("OPENROUTER_MODEL", "   "),
            ("EVOLUTION_INSTANCE", "env-instance"),
            ("DEBOUNCE_SECONDS", "3"),
            ("EVOLUTION_WEBHOOK_API_KEY", "hook"),
        ]);
        let mut cfg = complete();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.database.url, "postgres://env/relay");
        assert_eq!(cfg.llm.model, "openai/gpt-5.2");
        assert_eq!(cfg.gateway.instance, "env-instance");
        assert_eq!(cfg.agent.debounce_seconds, 3);
        assert_eq!(cfg.gateway.webhook_api_key.as_deref(), Some("hook"));
    }

    #[test]
    fn invalid_debounce_override_keeps_previous_value() {
        let mut cfg = complete();
        cfg.apply_env_overrides(|key| (key == "DEBOUNCE_SECONDS").then(|| "soon".to_string()));
        assert_eq!(cfg.agent.debounce_seconds, 10);
    }

    #[test]
    fn validate_requires_credentials_and_sane_ranges() {
        assert!(complete().validate().is_ok());
        assert!(RelayConfig::default().validate().is_err());

        let mut cfg = complete();
        cfg.gateway.instance = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = complete();
        cfg.delivery.typing_min_ms = 70_000;
        assert!(cfg.validate().is_err());

        let mut cfg = complete();
        cfg.delivery.pause_min_ms = 2_000;
        assert!(cfg.validate().is_err());

        let mut cfg = complete();
        cfg.server.bind_addr = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = complete();
        cfg.database.max_connections = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn concurrent_passes_leave_one_pooled_connection_free() {
        let mut cfg = complete();
        assert_eq!(cfg.max_concurrent_passes(), 9);
        cfg.database.max_connections = 2;
        assert_eq!(cfg.max_concurrent_passes(), 1);
        cfg.database.max_connections = 3;
        assert_eq!(cfg.max_concurrent_passes(), 2);
    }

    #[tokio::test]
    async fn explicit_missing_path_is_an_error() {
        let err = RelayConfig::read(Some(PathBuf::from("/nonexistent/wa-relay.toml")))
            .await
            .expect_err("missing explicit config");
        assert!(err.to_string().contains("read config"));
    }
}
