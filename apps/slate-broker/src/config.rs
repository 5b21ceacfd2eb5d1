use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Base URL under which this broker is reachable by HLSS backends; used
    /// to construct the per-instance callback URLs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// HS256 signing secret for device and instance tokens. A random
    /// ephemeral secret is generated when unset (dev/test only - tokens do
    /// not survive a restart).
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: u64,
    /// Bound on every broker-to-HLSS call.
    #[serde(default = "default_hlss_timeout")]
    pub hlss_timeout_secs: u64,
    /// Next-poll hint returned to devices.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("SLATE").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| AppConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.token_secret = Self::normalize_opt(self.token_secret.take());
        self.public_base_url = self.public_base_url.trim_end_matches('/').to_string();
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
            token_secret: None,
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
            hlss_timeout_secs: default_hlss_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_access_token_ttl() -> u64 {
    24 * 60 * 60
}

fn default_refresh_token_ttl() -> u64 {
    30 * 24 * 60 * 60
}

fn default_hlss_timeout() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    5_000
}
