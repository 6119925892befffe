use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    /// `lora:<thing> <-> <devEUI>`
    #[serde(default = "PluginConfig::things_prefix_default")]
    pub things_prefix: String,
    /// `lora-app:<channel> <-> <appID>`
    #[serde(default = "PluginConfig::channels_prefix_default")]
    pub channels_prefix: String,
    /// `lora-conn:<channel>:<thing>`
    #[serde(default = "PluginConfig::connections_prefix_default")]
    pub connections_prefix: String,

    /// Service credential, an `Authorization` header value. Used for uplinks
    /// that arrive without a connection credential and for downlink
    /// subscriptions.
    #[serde(default)]
    pub authorization: Option<String>,

    /// Subtopic uplinks are published on, empty for the bare channel.
    #[serde(default)]
    pub uplink_subtopic: String,

    /// Patterns delivered to devices, `<channel>.<thing>[.<rest>]`.
    #[serde(default)]
    pub downlinks: Vec<String>,
    #[serde(default = "PluginConfig::downlink_topic_default")]
    pub downlink_topic: String,
    #[serde(default = "PluginConfig::fport_default")]
    pub fport: u8,
    #[serde(default)]
    pub confirmed: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            things_prefix: Self::things_prefix_default(),
            channels_prefix: Self::channels_prefix_default(),
            connections_prefix: Self::connections_prefix_default(),
            authorization: None,
            uplink_subtopic: String::new(),
            downlinks: Vec::new(),
            downlink_topic: Self::downlink_topic_default(),
            fport: Self::fport_default(),
            confirmed: false,
        }
    }
}

impl PluginConfig {
    fn things_prefix_default() -> String {
        "lora".into()
    }

    fn channels_prefix_default() -> String {
        "lora-app".into()
    }

    fn connections_prefix_default() -> String {
        "lora-conn".into()
    }

    fn downlink_topic_default() -> String {
        "application/{app}/device/{dev}/tx".into()
    }

    fn fport_default() -> u8 {
        1
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "things_prefix": self.things_prefix,
            "channels_prefix": self.channels_prefix,
            "connections_prefix": self.connections_prefix,
            "uplink_subtopic": self.uplink_subtopic,
            "downlinks": self.downlinks,
            "downlink_topic": self.downlink_topic,
            "fport": self.fport,
            "confirmed": self.confirmed,
        })
    }
}
