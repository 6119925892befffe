use std::path::Path;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// The `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub to: To,
    #[serde(default = "Log::level_default", deserialize_with = "deserialize_level")]
    pub level: slog::Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    fn level_default() -> slog::Level {
        slog::Level::Info
    }
    fn dir_default() -> String {
        "/var/log/mfabric".into()
    }
    fn file_default() -> String {
        "mfabric.log".into()
    }

    /// `dir/file`, empty when no file is configured.
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        Path::new(&self.dir).join(&self.file).to_string_lossy().into_owned()
    }
}

/// Where log records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    #[default]
    Console,
    Both,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse::<slog::Level>().map_err(|_| de::Error::custom(format!("invalid log level `{level}`")))
}
