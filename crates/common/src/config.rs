//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Queue (broker) configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Verification token configuration.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Outgoing mail configuration.
    pub mail: MailConfig,
    /// Worker process configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// The sections the delivery worker reads.
///
/// Loaded from the same sources as [`Config`], so a worker host needs no
/// server or database settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Queue (broker) configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Outgoing mail configuration.
    pub mail: MailConfig,
    /// Worker process configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    pub url: String,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Broker configuration for the verification email queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Redis connection URL. `None` means the broker is unconfigured.
    #[serde(default)]
    pub url: Option<String>,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_queue_prefix")]
    pub prefix: String,
    /// Name of the durable queue.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Consumer group shared by all workers.
    #[serde(default = "default_consumer_group")]
    pub group: String,
    /// Consumer name of this worker instance. Defaults to a random name.
    #[serde(default)]
    pub consumer: Option<String>,
    /// How long an idle receive waits before polling the stream again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pending messages idle for longer than this are reclaimed from dead consumers.
    #[serde(default = "default_claim_idle_secs")]
    pub claim_idle_secs: u64,
    /// Wait for the broker to fsync each published job.
    #[serde(default = "default_true")]
    pub durable_writes: bool,
    /// Timeout for the durability confirmation.
    #[serde(default = "default_durable_timeout_ms")]
    pub durable_timeout_ms: u64,
    /// Attempts before a failing job is dead-lettered. `None` requeues forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Verification token configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Token time-to-live in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Interval of the expired-token sweep. `None` disables the sweep.
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

/// Outgoing mail configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Sender address.
    pub from_address: String,
    /// Sender display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Base URL of the verification link; the token is appended as a query parameter.
    pub link_base: String,
    /// SMTP transport. `None` logs messages instead of sending them.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Per-message send timeout in seconds, 0 disables it.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

/// SMTP configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// SMTP host
    pub host: String,
    /// SMTP port
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Use implicit TLS instead of STARTTLS
    #[serde(default)]
    pub implicit_tls: bool,
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Grace period for in-flight work on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    100
}

const fn default_min_connections() -> u32 {
    5
}

fn default_queue_prefix() -> String {
    "mailverify".to_string()
}

fn default_queue_name() -> String {
    "email_verification".to_string()
}

fn default_consumer_group() -> String {
    "mailers".to_string()
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_claim_idle_secs() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

const fn default_durable_timeout_ms() -> u64 {
    2000
}

const fn default_token_ttl_secs() -> u64 {
    24 * 3600
}

fn default_from_name() -> String {
    "mailverify".to_string()
}

const fn default_send_timeout_secs() -> u64 {
    60
}

const fn default_smtp_port() -> u16 {
    587
}

const fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefix: default_queue_prefix(),
            name: default_queue_name(),
            group: default_consumer_group(),
            consumer: None,
            poll_interval_ms: default_poll_interval_ms(),
            claim_idle_secs: default_claim_idle_secs(),
            durable_writes: default_true(),
            durable_timeout_ms: default_durable_timeout_ms(),
            max_attempts: None,
        }
    }
}

impl QueueConfig {
    /// Redis key of the job stream.
    #[must_use]
    pub fn stream_key(&self) -> String {
        format!("{}:{}", self.prefix, self.name)
    }

    /// Redis key of the dead-letter stream.
    #[must_use]
    pub fn dead_letter_key(&self) -> String {
        format!("{}:{}:dead", self.prefix, self.name)
    }

    /// Wait between polls of an empty stream.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle time after which a pending message is reclaimed.
    #[must_use]
    pub const fn claim_idle(&self) -> Duration {
        Duration::from_secs(self.claim_idle_secs)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            sweep_interval_secs: None,
        }
    }
}

impl VerificationConfig {
    /// Token time-to-live.
    #[must_use]
    pub const fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Sweep interval, if the sweep is enabled.
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl MailConfig {
    /// Per-message send timeout, if enabled.
    #[must_use]
    pub const fn send_timeout(&self) -> Option<Duration> {
        if self.send_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.send_timeout_secs))
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl WorkerConfig {
    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `MAILVERIFY_ENV`)
    /// 4. Environment variables with `MAILVERIFY__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        layered_sources()?.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MAILVERIFY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl WorkerSettings {
    /// Load the worker sections from the sources [`Config::load`] reads.
    pub fn load() -> Result<Self, config::ConfigError> {
        layered_sources()?.try_deserialize()
    }
}

fn layered_sources() -> Result<config::Config, config::ConfigError> {
    dotenvy::dotenv().ok();

    let env = std::env::var("MAILVERIFY_ENV").unwrap_or_else(|_| "development".to_string());

    config::Config::builder()
        .add_source(config::File::with_name("config/default").required(false))
        .add_source(config::File::with_name(&format!("config/{env}")).required(false))
        .add_source(
            config::Environment::with_prefix("MAILVERIFY")
                .separator("__")
                .try_parsing(true),
        )
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn source(toml: &str) -> config::Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
    }

    fn parse(toml: &str) -> Config {
        source(toml).try_deserialize().unwrap()
    }

    const MINIMAL: &str = r#"
        [server]
        url = "https://example.com"

        [database]
        url = "postgres://localhost/mailverify"

        [mail]
        from_address = "noreply@example.com"
        link_base = "https://example.com/verify-email"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(MINIMAL);

        assert_eq!(config.server.port, 3000);
        assert!(config.queue.url.is_none());
        assert_eq!(config.queue.name, "email_verification");
        assert!(config.queue.durable_writes);
        assert!(config.queue.max_attempts.is_none());
        assert_eq!(config.verification.token_ttl(), Duration::from_secs(86400));
        assert!(config.verification.sweep_interval().is_none());
        assert_eq!(config.worker.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.mail.send_timeout(), Some(Duration::from_secs(60)));
        assert!(config.mail.smtp.is_none());
    }

    #[test]
    fn test_queue_keys() {
        let queue = QueueConfig {
            prefix: "mv".to_string(),
            name: "verify".to_string(),
            ..Default::default()
        };
        assert_eq!(queue.stream_key(), "mv:verify");
        assert_eq!(queue.dead_letter_key(), "mv:verify:dead");
    }

    #[test]
    fn test_zero_intervals_disable_features() {
        let toml = format!(
            "{MINIMAL}\n[verification]\nsweep_interval_secs = 0\n",
        );
        let mut config = parse(&toml);
        config.mail.send_timeout_secs = 0;

        assert!(config.verification.sweep_interval().is_none());
        assert!(config.mail.send_timeout().is_none());
    }

    #[test]
    fn test_worker_settings_without_server_sections() {
        let toml = r#"
            [queue]
            url = "redis://localhost:6379"
            max_attempts = 3

            [mail]
            from_address = "noreply@example.com"
            link_base = "https://example.com/verify-email"
        "#;

        let settings: WorkerSettings = source(toml).try_deserialize().unwrap();
        assert_eq!(settings.queue.max_attempts, Some(3));
        assert_eq!(settings.worker.shutdown_grace(), Duration::from_secs(5));

        assert!(source(toml).try_deserialize::<Config>().is_err());
    }

    #[test]
    fn test_worker_settings_require_mail() {
        let toml = "[queue]\nurl = \"redis://localhost:6379\"\n";
        assert!(source(toml).try_deserialize::<WorkerSettings>().is_err());
    }
}
