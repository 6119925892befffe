use std::time::Duration;

use serde::{Deserialize, Serialize};

use mfabric::utils::{deserialize_duration, deserialize_duration_option};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Comma separated server urls.
    #[serde(default = "PluginConfig::servers_default")]
    pub servers: String,
    #[serde(default = "PluginConfig::name_prefix_default")]
    pub name_prefix: String,
    #[serde(default)]
    pub max_reconnects: Option<usize>,
    #[serde(default = "PluginConfig::connection_timeout_default", deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub ping_interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub request_timeout: Option<Duration>,
    #[serde(default)]
    pub sender_capacity: Option<usize>,
    #[serde(default)]
    pub retry_on_initial_connect: bool,
    #[serde(default)]
    pub tls_required: Option<bool>,
    #[serde(default)]
    pub auth: Auth,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            servers: Self::servers_default(),
            name_prefix: Self::name_prefix_default(),
            max_reconnects: None,
            connection_timeout: Self::connection_timeout_default(),
            ping_interval: None,
            request_timeout: None,
            sender_capacity: None,
            retry_on_initial_connect: false,
            tls_required: None,
            auth: Auth::default(),
        }
    }
}

impl PluginConfig {
    fn servers_default() -> String {
        "nats://127.0.0.1:4222".into()
    }

    fn name_prefix_default() -> String {
        "mfabric".into()
    }

    fn connection_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Default, Clone, Deserialize, Serialize)]
pub struct Auth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "******"))
            .field("token", &self.token.as_ref().map(|_| "******"))
            .finish()
    }
}
