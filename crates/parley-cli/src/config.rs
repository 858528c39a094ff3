use parley_agent::ModelConfig;
use parley_core::{ParleyError, ParleyResult};
use parley_session::ReconnectPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ParleyConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub ingress: IngressSettings,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebSocket sidecar speaking to the messaging network.
    #[default]
    Bridge,
    /// In-process transport, for local development.
    Loopback,
}

#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            bridge_url: default_bridge_url(),
            event_buffer: default_event_buffer(),
            send_timeout_secs: default_send_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngressSettings {
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_restore_wait_secs")]
    pub restore_wait_secs: u64,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            handler_timeout_secs: default_handler_timeout_secs(),
            system_prompt: None,
            restore_wait_secs: default_restore_wait_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8085".to_string()
}
fn default_event_buffer() -> usize {
    256
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_open_timeout_secs() -> u64 {
    30
}
fn default_history_window() -> usize {
    20
}
fn default_handler_timeout_secs() -> u64 {
    120
}
fn default_restore_wait_secs() -> u64 {
    15
}

impl ParleyConfig {
    pub fn parse(source: &str) -> ParleyResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ParleyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> ParleyResult<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            ParleyError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::parse(&source)
    }

    pub fn validate(&self) -> ParleyResult<()> {
        if self.server.host.trim().is_empty() {
            return Err(ParleyError::Config("server.host must not be empty".into()));
        }
        if self.transport.kind == TransportKind::Bridge
            && !(self.transport.bridge_url.starts_with("ws://")
                || self.transport.bridge_url.starts_with("wss://"))
        {
            return Err(ParleyError::Config(format!(
                "transport.bridge_url must be a ws:// or wss:// URL, got '{}'",
                self.transport.bridge_url
            )));
        }
        // Auto-pairing and the open events need room in the channel.
        if self.transport.event_buffer < 2 {
            return Err(ParleyError::Config(
                "transport.event_buffer must be at least 2".into(),
            ));
        }
        if self.transport.send_timeout_secs == 0 {
            return Err(ParleyError::Config(
                "transport.send_timeout_secs must be positive".into(),
            ));
        }
        if self.transport.open_timeout_secs == 0 {
            return Err(ParleyError::Config(
                "transport.open_timeout_secs must be positive".into(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ParleyError::Config(
                "reconnect.base_delay_ms must be positive".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ParleyError::Config(format!(
                "reconnect.max_delay_ms ({}) is below reconnect.base_delay_ms ({})",
                self.reconnect.max_delay_ms, self.reconnect.base_delay_ms
            )));
        }
        if self.ingress.handler_timeout_secs == 0 {
            return Err(ParleyError::Config(
                "ingress.handler_timeout_secs must be positive".into(),
            ));
        }
        self.model.validate()
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.ingress.handler_timeout_secs)
    }

    pub fn restore_wait(&self) -> Duration {
        Duration::from_secs(self.ingress.restore_wait_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.send_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.open_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ParleyConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.transport.kind, TransportKind::Bridge);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.ingress.history_window, 20);
        assert_eq!(config.restore_wait(), Duration::from_secs(15));
        assert_eq!(config.open_timeout(), Duration::from_secs(30));
        assert_eq!(config.db_path(), PathBuf::from("./data/parley.db"));
        assert!(config.security.api_keys.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = ParleyConfig::parse(
            r#"
            data_dir = "/var/lib/parley"

            [server]
            port = 8080

            [security]
            api_keys = ["k1"]

            [transport]
            kind = "loopback"

            [reconnect]
            base_delay_ms = 3000
            max_delay_ms = 3000

            [ingress]
            system_prompt = "You are the assistant of Loja Azul."

            [model]
            provider = "groq"
            model_id = "llama-3.1-8b-instant"
            api_key_env = "GROQ_KEY"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transport.kind, TransportKind::Loopback);
        assert_eq!(config.reconnect.delay(5), Duration::from_secs(3));
        assert_eq!(config.credentials_dir(), PathBuf::from("/var/lib/parley/credentials"));
        assert_eq!(config.model.model_id, "llama-3.1-8b-instant");
    }

    #[test]
    fn test_validation_names_the_field() {
        let err = ParleyConfig::parse("[transport]\nbridge_url = \"http://bridge\"").unwrap_err();
        assert!(err.to_string().contains("transport.bridge_url"));

        let err = ParleyConfig::parse("[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 100")
            .unwrap_err();
        assert!(err.to_string().contains("reconnect.max_delay_ms"));

        let err = ParleyConfig::parse("[transport]\nopen_timeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("transport.open_timeout_secs"));

        let err = ParleyConfig::parse("[model]\ntemperature = 9.0").unwrap_err();
        assert!(err.to_string().contains("model.temperature"));

        // A loopback transport does not need a bridge URL.
        assert!(ParleyConfig::parse("[transport]\nkind = \"loopback\"\nbridge_url = \"\"").is_ok());
    }

    #[test]
    fn test_unknown_transport_kind_is_rejected() {
        assert!(matches!(
            ParleyConfig::parse("[transport]\nkind = \"carrier-pigeon\""),
            Err(ParleyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ParleyConfig::load(&dir.path().join("parley.toml")).await.unwrap_err();
        assert!(err.to_string().contains("parley.toml"));
    }
}
