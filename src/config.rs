//! Client settings
//!
//! Settings are read from `~/.config/speech-stream/settings.json` (or any
//! path the application chooses) and can be overridden from the environment.
//! Every field has a default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::streaming::auth::{Credentials, DEFAULT_AUTH_ENDPOINT};

const SETTINGS_DIR_NAME: &str = "speech-stream";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Default total time budget for connecting (including retries)
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: f64 = 120.0;

/// Default interval between client pings
pub const AUTO_PING_INTERVAL_SECONDS: u64 = 60;

/// Environment variable holding a ready-made bearer token
pub const ACCESS_TOKEN_ENV: &str = "SPEECH_STREAM_ACCESS_TOKEN";

/// Environment variable holding an API key to exchange for a token
pub const API_KEY_ENV: &str = "SPEECH_STREAM_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Total time spent retrying a connect before giving up.
    pub max_connection_retry_seconds: f64,

    /// Socket-level timeout for the handshake and for each receive.
    /// `None` leaves it to the OS.
    pub socket_timeout_seconds: Option<f64>,

    /// Interval between keepalive pings. `None` disables them.
    pub auto_ping_interval_seconds: Option<u64>,

    /// How long to wait for the media sender to stop before a reconnect.
    pub media_stop_timeout_ms: u64,

    /// Reconnect after a dropped connection. When disabled a connection
    /// loss ends the session with an error.
    pub reconnect: bool,

    /// Token exchange endpoint used with API key credentials.
    pub auth_endpoint: String,

    /// `log` target for every record the client emits.
    pub log_target: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_connection_retry_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            socket_timeout_seconds: None,
            auto_ping_interval_seconds: Some(AUTO_PING_INTERVAL_SECONDS),
            media_stop_timeout_ms: 1000,
            reconnect: true,
            auth_endpoint: DEFAULT_AUTH_ENDPOINT.to_string(),
            log_target: "speech_stream".to_string(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl ClientSettings {
    pub fn max_connection_retry(&self) -> Duration {
        seconds(self.max_connection_retry_seconds)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout_seconds
            .map(seconds)
            .filter(|d| !d.is_zero())
    }

    pub fn auto_ping_interval(&self) -> Option<Duration> {
        self.auto_ping_interval_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn media_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.media_stop_timeout_ms)
    }

    /// Apply `SPEECH_STREAM_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key/value lookup (unparseable values are ignored)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!("Settings: ignoring invalid {}={:?}", key, raw);
                    None
                }
            }
        }

        const RETRY: &str = "SPEECH_STREAM_MAX_RETRY_SECONDS";
        const SOCKET_TIMEOUT: &str = "SPEECH_STREAM_SOCKET_TIMEOUT_SECONDS";
        const PING: &str = "SPEECH_STREAM_PING_INTERVAL_SECONDS";
        const RECONNECT: &str = "SPEECH_STREAM_RECONNECT";

        if let Some(v) = parsed(RETRY, lookup(RETRY)) {
            self.max_connection_retry_seconds = v;
        }
        if let Some(v) = parsed::<f64>(SOCKET_TIMEOUT, lookup(SOCKET_TIMEOUT)) {
            self.socket_timeout_seconds = Some(v);
        }
        if let Some(v) = parsed::<u64>(PING, lookup(PING)) {
            self.auto_ping_interval_seconds = (v > 0).then_some(v);
        }
        if let Some(v) = parsed(RECONNECT, lookup(RECONNECT)) {
            self.reconnect = v;
        }
        if let Some(v) = lookup("SPEECH_STREAM_AUTH_ENDPOINT").filter(|v| !v.is_empty()) {
            self.auth_endpoint = v;
        }
        if let Some(v) = lookup("SPEECH_STREAM_LOG_TARGET").filter(|v| !v.is_empty()) {
            self.log_target = v;
        }
    }
}

/// `~/.config/speech-stream/settings.json`, if a config dir exists
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from a JSON file; missing or broken files yield defaults
pub fn load_settings(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

/// Credentials from the environment: an access token wins over an API key
pub fn credentials_from_env() -> Option<Credentials> {
    credentials_from(|key| std::env::var(key).ok())
}

fn credentials_from(lookup: impl Fn(&str) -> Option<String>) -> Option<Credentials> {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    non_empty(ACCESS_TOKEN_ENV)
        .map(Credentials::AccessToken)
        .or_else(|| non_empty(API_KEY_ENV).map(Credentials::ApiKey))
}
