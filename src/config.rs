//! Runtime configuration, read from the process environment.
//!
//! The binary loads a `.env` file first (via `dotenvy`), so every key below
//! can also live there.

use crate::error::{ChatError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";

/// What the conversation store does when a history fetch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryFailurePolicy {
    /// Fall back to `Ready` with an empty sequence.
    #[default]
    ReadyEmpty,
    /// Stay in `LoadingHistory` until the user selects again.
    StayLoading,
}

impl FromStr for HistoryFailurePolicy {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready-empty" | "ready_empty" => Ok(Self::ReadyEmpty),
            "stay-loading" | "stay_loading" => Ok(Self::StayLoading),
            other => Err(ChatError::Config(format!(
                "unknown history failure policy '{}'",
                other
            ))),
        }
    }
}

/// How realtime messages for the selected peer are merged into its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealtimeOrdering {
    /// Hold messages while history loads, then append them after it,
    /// skipping ids the history already holds.
    #[default]
    Buffered,
    /// Append in arrival order to whatever sequence currently exists.
    Arrival,
}

impl FromStr for RealtimeOrdering {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffered" => Ok(Self::Buffered),
            "arrival" => Ok(Self::Arrival),
            other => Err(ChatError::Config(format!(
                "unknown realtime ordering '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend_url: String,
    pub socket_url: String,
    pub db_path: PathBuf,
    pub history_failure_policy: HistoryFailurePolicy,
    pub realtime_ordering: RealtimeOrdering,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            socket_url: socket_url_for(DEFAULT_BACKEND_URL),
            db_path: default_db_path(),
            history_failure_policy: HistoryFailurePolicy::default(),
            realtime_ordering: RealtimeOrdering::default(),
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("QUICKCHAT_BACKEND_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ChatError::Config(format!(
                    "QUICKCHAT_BACKEND_URL must be an http(s) URL, got '{}'",
                    url
                )));
            }
            config.socket_url = socket_url_for(&url);
            config.backend_url = url;
        }

        if let Some(url) = lookup("QUICKCHAT_SOCKET_URL") {
            config.socket_url = url.trim().to_string();
        }

        if let Some(path) = lookup("QUICKCHAT_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(policy) = lookup("QUICKCHAT_HISTORY_FAILURE_POLICY") {
            config.history_failure_policy = policy.parse()?;
        }

        if let Some(ordering) = lookup("QUICKCHAT_REALTIME_ORDERING") {
            config.realtime_ordering = ordering.parse()?;
        }

        if let Some(secs) = lookup("QUICKCHAT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("QUICKCHAT_REQUEST_TIMEOUT_SECS", &secs)?;
        }

        if let Some(secs) = lookup("QUICKCHAT_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = parse_secs("QUICKCHAT_RECONNECT_DELAY_SECS", &secs)?;
        }

        Ok(config)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ChatError::Config(format!("{} must be a whole number of seconds", key)))
}

fn socket_url_for(backend_url: &str) -> String {
    let base = backend_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/socket.io/", ws)
}

fn default_db_path() -> PathBuf {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home_dir).join(".quickchat").join("quickchat.db")
}
