//! Typed configuration, loaded from a YAML document. Every field has a safe
//! default so a missing file boots a usable instance; a malformed file is a
//! fatal init error.

use ::config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub mq: MqConfig,
    pub consumer: ConsumerConfig,
    pub reconciler: ReconcilerConfig,
    pub stock: StockConfig,
    pub rate_limit: RateLimitConfig,
    pub dlq: DlqConfig,
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::new(path, FileFormat::Yaml).required(false))
            .build()?;
        settings.try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub expire_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self { secret: "seckill-dev-secret".to_string(), expire_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    pub channel_pool_size: usize,
    pub consumer_prefetch: usize,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self { channel_pool_size: 16, consumer_prefetch: 300 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerMode {
    /// Trust the hot counter; the reconciler closes the loop.
    Aggressive,
    /// Also decrement durable stock transactionally per order.
    Conservative,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub mode: ConsumerMode,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { batch_size: 200, flush_interval_ms: 200, mode: ConsumerMode::Aggressive }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    pub batch: usize,
    pub monotonic_guard: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval_ms: 100, batch: 1000, monotonic_guard: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StockConfig {
    /// Upper bound on a returned counter; 0 disables the guard.
    pub return_cap: i64,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self { return_cap: 1_000_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_sec: u32,
    pub burst: u32,
    /// Buckets idle longer than this are swept.
    pub idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { per_sec: 50, burst: 100, idle_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub alarm_log: String,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { alarm_log: "dlq_alarm.log".to_string() }
    }
}
