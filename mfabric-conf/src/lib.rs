#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigBuilder, File, FileFormat, Source};
use serde::Deserialize;

use mfabric_utils::*;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

pub type NodeId = u64;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub pubsub: PubSub,
    #[serde(default)]
    pub event_log: EventLog,
    #[serde(default)]
    pub route_map: RouteMap,
    #[serde(default)]
    pub plugins: Plugins,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mfabric/mfabric").required(false))
            .add_source(File::with_name("mfabric").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        Self::build(Self::with_env(builder), opts)
    }

    /// Settings from a TOML document, environment overrides still apply.
    pub fn from_toml(text: &str) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::build(Self::with_env(builder), Options::default())
    }

    fn with_env(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> ConfigBuilder<config::builder::DefaultState> {
        builder.add_source(
            config::Environment::with_prefix("mfabric")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("plugins.default_startups"),
        )
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>, opts: Options) -> Result<Self> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(id) = opts.node_id {
            inner.node.id = id;
        }
        if let Some(plugins_default_startups) = opts.plugins_default_startups.as_ref() {
            inner.plugins.default_startups.clone_from(plugins_default_startups)
        }
        if let Some(max_payload) = opts.max_payload {
            inner.message.max_payload = max_payload;
        }

        if inner.message.max_subtopic_labels == 0 {
            return Err(anyhow::anyhow!("message.max_subtopic_labels must be greater than 0"));
        }
        if inner.message.subject_prefix.is_empty() || inner.message.subject_prefix.contains('.') {
            return Err(anyhow::anyhow!(
                "message.subject_prefix must be a single non-empty label, got {:?}",
                inner.message.subject_prefix
            ));
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node_id is {}", self.node.id);
        log::info!("message config is: {:?}", self.message);
        log::info!("pubsub config is: {:?}", self.pubsub);
        log::info!("event_log config is: {:?}", self.event_log);
        log::info!(
            "auth cache ttl: {:?}, negative ttl: {:?}, capacity: {}",
            self.auth.cache_ttl,
            self.auth.negative_cache_ttl,
            self.auth.cache_capacity
        );
        if self.auth.token.active_key.secret.is_empty() {
            log::warn!("auth.token.active_key.secret is empty, bearer tokens can not be verified");
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: NodeId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default = "Message::max_payload_default")]
    pub max_payload: Bytesize,
    //Platform-wide subject prefix, "m" renders subjects as m.<channel>.<subtopic>
    #[serde(default = "Message::subject_prefix_default")]
    pub subject_prefix: String,
    #[serde(default = "Message::max_subtopic_labels_default")]
    pub max_subtopic_labels: usize,
}

impl Default for Message {
    #[inline]
    fn default() -> Self {
        Self {
            max_payload: Self::max_payload_default(),
            subject_prefix: Self::subject_prefix_default(),
            max_subtopic_labels: Self::max_subtopic_labels_default(),
        }
    }
}

impl Message {
    fn max_payload_default() -> Bytesize {
        Bytesize::from(1024 * 1024)
    }
    fn subject_prefix_default() -> String {
        "m".into()
    }
    fn max_subtopic_labels_default() -> usize {
        16
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    #[serde(default = "Auth::cache_ttl_default", deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    //Denials are not cached unless this is set
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub negative_cache_ttl: Option<Duration>,
    #[serde(default = "Auth::cache_capacity_default")]
    pub cache_capacity: usize,
    #[serde(default = "Auth::cache_shards_default")]
    pub cache_shards: usize,
    #[serde(default = "Auth::oracle_timeout_default", deserialize_with = "deserialize_duration")]
    pub oracle_timeout: Duration,
    #[serde(default = "Auth::oracle_retries_default")]
    pub oracle_retries: u32,
    #[serde(default = "Auth::oracle_retry_backoff_default", deserialize_with = "deserialize_duration")]
    pub oracle_retry_backoff: Duration,
    #[serde(default = "Auth::policies_group_default")]
    pub policies_group: String,
    #[serde(default)]
    pub token: Token,
}

impl Default for Auth {
    #[inline]
    fn default() -> Self {
        Self {
            cache_ttl: Self::cache_ttl_default(),
            negative_cache_ttl: None,
            cache_capacity: Self::cache_capacity_default(),
            cache_shards: Self::cache_shards_default(),
            oracle_timeout: Self::oracle_timeout_default(),
            oracle_retries: Self::oracle_retries_default(),
            oracle_retry_backoff: Self::oracle_retry_backoff_default(),
            policies_group: Self::policies_group_default(),
            token: Token::default(),
        }
    }
}

impl Auth {
    fn cache_ttl_default() -> Duration {
        Duration::from_secs(5)
    }
    fn cache_capacity_default() -> usize {
        100_000
    }
    fn cache_shards_default() -> usize {
        16
    }
    fn oracle_timeout_default() -> Duration {
        Duration::from_secs(1)
    }
    fn oracle_retries_default() -> u32 {
        2
    }
    fn oracle_retry_backoff_default() -> Duration {
        Duration::from_millis(50)
    }
    fn policies_group_default() -> String {
        "auth-cache".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    #[serde(default = "Token::issuer_default")]
    pub issuer: String,
    #[serde(default = "Token::access_ttl_default", deserialize_with = "deserialize_duration")]
    pub access_ttl: Duration,
    #[serde(default)]
    pub active_key: SigningKey,
    #[serde(default)]
    pub retiring_key: Option<SigningKey>,
}

impl Default for Token {
    #[inline]
    fn default() -> Self {
        Self {
            issuer: Self::issuer_default(),
            access_ttl: Self::access_ttl_default(),
            active_key: SigningKey::default(),
            retiring_key: None,
        }
    }
}

impl Token {
    fn issuer_default() -> String {
        "mfabric.auth".into()
    }
    fn access_ttl_default() -> Duration {
        Duration::from_secs(60 * 60)
    }
}

#[derive(Clone, Deserialize)]
pub struct SigningKey {
    #[serde(default = "SigningKey::id_default")]
    pub id: String,
    #[serde(default)]
    pub secret: String,
}

impl Default for SigningKey {
    fn default() -> Self {
        Self { id: Self::id_default(), secret: String::new() }
    }
}

impl SigningKey {
    fn id_default() -> String {
        "default".into()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SigningKey").field("id", &self.id).field("secret", &"***").finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSub {
    #[serde(default = "PubSub::recovery_queue_capacity_default")]
    pub recovery_queue_capacity: usize,
    #[serde(default = "PubSub::publish_timeout_default", deserialize_with = "deserialize_duration")]
    pub publish_timeout: Duration,
    //Per-subscription delivery buffer, overflow counts as a slow consumer
    #[serde(default = "PubSub::subscriber_channel_capacity_default")]
    pub subscriber_channel_capacity: usize,
    //Startup deadline for the first broker connection
    #[serde(default = "PubSub::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "PubSub::reconnect_initial_default", deserialize_with = "deserialize_duration")]
    pub reconnect_initial: Duration,
    #[serde(default = "PubSub::reconnect_max_default", deserialize_with = "deserialize_duration")]
    pub reconnect_max: Duration,
    #[serde(default = "PubSub::reconnect_deadline_default", deserialize_with = "deserialize_duration")]
    pub reconnect_deadline: Duration,
    #[serde(default = "PubSub::drain_timeout_default", deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,
}

impl Default for PubSub {
    #[inline]
    fn default() -> Self {
        Self {
            recovery_queue_capacity: Self::recovery_queue_capacity_default(),
            publish_timeout: Self::publish_timeout_default(),
            subscriber_channel_capacity: Self::subscriber_channel_capacity_default(),
            connect_timeout: Self::connect_timeout_default(),
            reconnect_initial: Self::reconnect_initial_default(),
            reconnect_max: Self::reconnect_max_default(),
            reconnect_deadline: Self::reconnect_deadline_default(),
            drain_timeout: Self::drain_timeout_default(),
        }
    }
}

impl PubSub {
    fn recovery_queue_capacity_default() -> usize {
        1_000_000
    }
    fn publish_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn subscriber_channel_capacity_default() -> usize {
        1024
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn reconnect_initial_default() -> Duration {
        Duration::from_millis(100)
    }
    fn reconnect_max_default() -> Duration {
        Duration::from_secs(30)
    }
    fn reconnect_deadline_default() -> Duration {
        Duration::from_secs(60)
    }
    fn drain_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLog {
    #[serde(default = "EventLog::max_len_default")]
    pub max_len: usize,
    #[serde(default = "EventLog::batch_default")]
    pub batch: usize,
    #[serde(default = "EventLog::block_default", deserialize_with = "deserialize_duration")]
    pub block: Duration,
    #[serde(default = "EventLog::nack_limit_default")]
    pub nack_limit: u32,
    #[serde(default = "EventLog::redelivery_backoff_default", deserialize_with = "deserialize_duration")]
    pub redelivery_backoff: Duration,
    #[serde(default = "EventLog::dead_letter_suffix_default")]
    pub dead_letter_suffix: String,
    //Fresh consumer groups start at the head instead of the tail
    #[serde(default)]
    pub backfill: bool,
}

impl Default for EventLog {
    #[inline]
    fn default() -> Self {
        Self {
            max_len: Self::max_len_default(),
            batch: Self::batch_default(),
            block: Self::block_default(),
            nack_limit: Self::nack_limit_default(),
            redelivery_backoff: Self::redelivery_backoff_default(),
            dead_letter_suffix: Self::dead_letter_suffix_default(),
            backfill: false,
        }
    }
}

impl EventLog {
    fn max_len_default() -> usize {
        10_000
    }
    fn batch_default() -> usize {
        100
    }
    fn block_default() -> Duration {
        Duration::from_millis(100)
    }
    fn nack_limit_default() -> u32 {
        5
    }
    fn redelivery_backoff_default() -> Duration {
        Duration::from_millis(200)
    }
    fn dead_letter_suffix_default() -> String {
        ".dlq".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteMap {
    #[serde(default = "RouteMap::cache_ttl_default", deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    #[serde(default = "RouteMap::cache_capacity_default")]
    pub cache_capacity: usize,
}

impl Default for RouteMap {
    #[inline]
    fn default() -> Self {
        Self { cache_ttl: Self::cache_ttl_default(), cache_capacity: Self::cache_capacity_default() }
    }
}

impl RouteMap {
    fn cache_ttl_default() -> Duration {
        Duration::from_secs(30)
    }
    fn cache_capacity_default() -> usize {
        10_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plugins {
    #[serde(default = "Plugins::dir_default")]
    pub dir: String,
    #[serde(default)]
    pub default_startups: Vec<String>,
}

impl Default for Plugins {
    fn default() -> Self {
        Self { dir: Self::dir_default(), default_startups: Vec::new() }
    }
}

impl Plugins {
    fn dir_default() -> String {
        "./etc/plugins/".into()
    }

    pub fn load_config<'de, T: serde::Deserialize<'de>>(&self, name: &str) -> Result<T> {
        let (cfg, _) = self.load_config_with_required(name, true)?;
        Ok(cfg)
    }

    pub fn load_config_default<'de, T: serde::Deserialize<'de>>(&self, name: &str) -> Result<T> {
        let (cfg, def) = self.load_config_with_required(name, false)?;
        if def {
            log::warn!("The configuration for plugin '{name}' does not exist, default values will be used!");
        }
        Ok(cfg)
    }

    fn load_config_with_required<'de, T: serde::Deserialize<'de>>(
        &self,
        name: &str,
        required: bool,
    ) -> Result<(T, bool)> {
        let dir = self.dir.trim_end_matches(['/', '\\']);
        let builder = Config::builder()
            .add_source(File::with_name(&format!("{dir}/{name}")).required(required))
            .add_source(
                config::Environment::with_prefix(&format!("mfabric_plugin_{}", name.replace('-', "_")))
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let s = builder.build()?;
        let count = s.collect()?.len();
        Ok((s.try_deserialize::<T>()?, count == 0))
    }
}
