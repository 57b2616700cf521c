use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Default time to wait for the first push connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client configuration.
///
/// Built with [`ClientConfig::new`] or loaded from the environment with
/// [`ClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://host:8188`.
    pub ws_url: String,
    /// Per-request deadline. `None` waits for the server indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long [`ComfyClient::connect`](crate::client::ComfyClient::connect)
    /// waits for the push connection before giving up.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

/// An environment variable held a value that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} must be {expected}, got {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub expected: &'static str,
    pub value: String,
}

impl ClientConfig {
    /// Configuration for `api_url` with the WebSocket URL derived from it.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            request_timeout: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                     |
    /// |--------------------------------|-----------------------------|
    /// | `COMFYUI_URL`                  | `http://127.0.0.1:8188`     |
    /// | `COMFYUI_WS_URL`               | derived from `COMFYUI_URL`  |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS` | unset (no timeout)          |
    /// | `COMFYUI_CONNECT_TIMEOUT_SECS` | `10`                        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new(lookup("COMFYUI_URL").unwrap_or_else(|| DEFAULT_API_URL.into()));

        if let Some(ws_url) = lookup("COMFYUI_WS_URL") {
            config.ws_url = ws_url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = lookup("COMFYUI_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Some(parse_secs("COMFYUI_REQUEST_TIMEOUT_SECS", secs)?);
        }
        if let Some(secs) = lookup("COMFYUI_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = parse_secs("COMFYUI_CONNECT_TIMEOUT_SECS", secs)?;
        }
        Ok(config)
    }
}

fn parse_secs(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError {
            var,
            expected: "a whole number of seconds",
            value,
        })
}

/// `http://` becomes `ws://`, `https://` becomes `wss://`.
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}
