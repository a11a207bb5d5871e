//! Environment-provided configuration.
//!
//! Missing or invalid values never abort startup: the agent keeps running
//! and records every heartbeat as failed until the environment is fixed.

use url::Url;

/// Agent configuration, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Bearer token echoed verbatim in every heartbeat (`CLI_TOKEN`).
    pub cli_token: Option<String>,
    /// Absolute URL of the heartbeat endpoint (`SERVER_URL`).
    pub server_url: Option<Url>,
    /// Optional loopback address for the inspector (`INSPECTOR_ADDR`).
    pub inspector_addr: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let cli_token = read_nonempty("CLI_TOKEN");
        if cli_token.is_none() {
            log::warn!("CLI_TOKEN is not set; heartbeats will fail until it is provided");
        }

        let server_url = read_nonempty("SERVER_URL").and_then(|raw| match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("SERVER_URL {raw:?} is not a valid URL ({e}); treating it as unset");
                None
            }
        });
        if server_url.is_none() {
            log::warn!("SERVER_URL is not set; heartbeats will fail until it is provided");
        }

        Self {
            cli_token,
            server_url,
            inspector_addr: read_nonempty("INSPECTOR_ADDR"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.cli_token.is_some() && self.server_url.is_some()
    }
}

fn read_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
