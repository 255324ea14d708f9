use std::{fs, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub realtime_path: String,
    /// Reconnect attempts after an unexpected realtime drop; 0 disables.
    pub reconnect_attempts: usize,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            realtime_path: "/socket".into(),
            reconnect_attempts: 5,
            reconnect_min_delay_ms: 500,
            reconnect_max_delay_ms: 15_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    realtime_path: Option<String>,
    reconnect_attempts: Option<usize>,
    reconnect_min_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let raw = fs::read_to_string(SETTINGS_FILE).ok();
    Settings::from_sources(raw.as_deref(), |key| std::env::var(key).ok())
}

impl Settings {
    pub fn from_sources(
        file_contents: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut settings = Settings::default();

        if let Some(raw) = file_contents {
            match toml::from_str::<FileSettings>(raw) {
                Ok(file_cfg) => {
                    if let Some(v) = file_cfg.server_url {
                        settings.server_url = v;
                    }
                    if let Some(v) = file_cfg.realtime_path {
                        settings.realtime_path = v;
                    }
                    if let Some(v) = file_cfg.reconnect_attempts {
                        settings.reconnect_attempts = v;
                    }
                    if let Some(v) = file_cfg.reconnect_min_delay_ms {
                        settings.reconnect_min_delay_ms = v;
                    }
                    if let Some(v) = file_cfg.reconnect_max_delay_ms {
                        settings.reconnect_max_delay_ms = v;
                    }
                }
                Err(err) => {
                    tracing::warn!("ignoring malformed {SETTINGS_FILE}: {err}");
                }
            }
        }

        if let Some(v) = env("CHAT_SERVER_URL") {
            settings.server_url = v;
        }
        if let Some(v) = env("APP__SERVER_URL") {
            settings.server_url = v;
        }
        if let Some(v) = env("APP__REALTIME_PATH") {
            settings.realtime_path = v;
        }
        if let Some(parsed) = env("APP__RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            settings.reconnect_attempts = parsed;
        }
        if let Some(parsed) = env("APP__RECONNECT_MIN_DELAY_MS").and_then(|v| v.parse().ok()) {
            settings.reconnect_min_delay_ms = parsed;
        }
        if let Some(parsed) = env("APP__RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            settings.reconnect_max_delay_ms = parsed;
        }

        settings
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_min_delay_ms))
    }

    /// WebSocket endpoint for the realtime channel, carrying the credential as
    /// the handshake token.
    pub fn realtime_url(&self, token: &str) -> ClientResult<Url> {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        };

        let mut url = Url::parse(&format!("{ws_base}{}", self.realtime_path))
            .map_err(|err| ClientError::Config(format!("invalid realtime url: {err}")))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
