use std::time::Duration;

/// Live client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// REST API origin (e.g. `http://localhost:5000`).
    pub api_url: String,
    /// WebSocket URL of the live channel (e.g. `ws://localhost:5000/live`).
    pub live_url: String,
    /// First reconnect delay; doubled on every failed attempt.
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
    /// How long to wait for `ready` after sending `identify`.
    pub handshake_timeout: Duration,
    /// Interval between client pings on an open connection.
    pub heartbeat_interval: Duration,
    /// Messages requested per Q&A history page.
    pub history_page_size: u32,
    /// Window used to match a pending send against an echo that carries no client id.
    pub echo_match_window: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = Self::new(required_var("API_URL"), required_var("LIVE_URL"));
        Self {
            reconnect_base: millis_var("RECONNECT_BASE_MS").unwrap_or(defaults.reconnect_base),
            reconnect_max: millis_var("RECONNECT_MAX_MS").unwrap_or(defaults.reconnect_max),
            handshake_timeout: secs_var("HANDSHAKE_TIMEOUT_SECS")
                .unwrap_or(defaults.handshake_timeout),
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            history_page_size: std::env::var("HISTORY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .map(|v| v.clamp(1, 100))
                .unwrap_or(defaults.history_page_size),
            echo_match_window: secs_var("ECHO_MATCH_WINDOW_SECS")
                .unwrap_or(defaults.echo_match_window),
            ..defaults
        }
    }

    /// Build a configuration with default tuning for the given endpoints.
    pub fn new(api_url: impl Into<String>, live_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            live_url: live_url.into(),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            history_page_size: 50,
            echo_match_window: Duration::from_secs(30),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn millis_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
