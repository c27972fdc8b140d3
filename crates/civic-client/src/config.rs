use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `http://localhost:3000`.
    pub base_url: String,

    /// Reconnect attempts after the live channel drops.
    pub reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,

    /// Live messages kept per open issue.
    pub live_window: usize,

    /// Bounds REST calls and the live channel handshake.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            live_window: 100,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// The live channel endpoint derived from `base_url`.
    pub fn gateway_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/gateway", ws)
    }
}
