use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub socket_path: String,
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
    /// How long a positive join callback waits for the `room_joined` event
    /// before it is accepted on its own.
    pub join_ack_grace: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    pub typing_debounce: Duration,
    pub remote_typing_ttl: Duration,
    pub invitation_refresh_interval: Duration,
    pub page_size: u32,
    pub member_search_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".into(),
            socket_path: "/chat".into(),
            connect_timeout: Duration::from_secs(12),
            join_timeout: Duration::from_secs(8),
            join_ack_grace: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            auto_reconnect: true,
            typing_debounce: Duration::from_secs(2),
            remote_typing_ttl: Duration::from_secs(3),
            invitation_refresh_interval: Duration::from_secs(10),
            page_size: 10,
            member_search_limit: 8,
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint derived from the REST base url.
    pub fn socket_url(&self) -> anyhow::Result<Url> {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let path = if self.socket_path.starts_with('/') {
            self.socket_path.clone()
        } else {
            format!("/{}", self.socket_path)
        };
        Url::parse(&format!("{ws_base}{path}"))
            .with_context(|| format!("invalid socket url derived from {}", self.server_url))
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then a flat `key = "value"` toml file, then environment.
pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => tracing::warn!(path = %file.display(), "ignoring malformed settings file: {err}"),
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    apply(&mut settings, |key| env(&format!("APP__{}", key.to_ascii_uppercase())));

    settings
}

fn apply(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("socket_path") {
        settings.socket_path = v;
    }
    if let Some(ms) = parse_u64(&lookup, "connect_timeout_ms") {
        settings.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_u64(&lookup, "join_timeout_ms") {
        settings.join_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_u64(&lookup, "reconnect_delay_ms") {
        settings.reconnect_delay = Duration::from_millis(ms);
    }
    if let Some(attempts) = parse_u64(&lookup, "max_reconnect_attempts") {
        settings.max_reconnect_attempts = attempts.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(v) = lookup("auto_reconnect") {
        settings.auto_reconnect = !matches!(v.trim(), "0" | "false" | "off");
    }
    if let Some(secs) = parse_u64(&lookup, "invitation_refresh_secs") {
        settings.invitation_refresh_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(size) = parse_u64(&lookup, "page_size") {
        settings.page_size = size.clamp(1, 100) as u32;
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric setting");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
