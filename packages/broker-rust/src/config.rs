//! Configuration types for sessions, the broker substrate, and the binary.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::Rng;

/// Network address a session connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", 5672)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amqp://{}:{}", self.host, self.port)
    }
}

/// Username/password pair presented during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Settings for opening a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Upper bound on the handshake and the idle-connection cutoff.
    pub timeout: Duration,
    /// Liveness probe interval. `Duration::ZERO` disables heartbeats.
    pub heartbeat: Duration,
    /// Maximum number of channels opened over the session's lifetime.
    pub channel_max: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            credentials: Credentials::default(),
            timeout: Duration::from_millis(1_800_000), // 30 min
            heartbeat: Duration::from_secs(60),
            channel_max: 2047,
        }
    }
}

/// Server-side limits of the in-process broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerLimits {
    /// Capacity applied to queues declared without their own `max_length`.
    pub default_max_length: Option<usize>,
    /// Redeliveries after which a message is discarded instead of requeued.
    /// `None` requeues forever.
    pub max_redeliveries: Option<u32>,
}

/// Backoff schedule used by [`Session::open_with_retry`](crate::Session::open_with_retry).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Fraction of the backoff added as random jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Backoff before retry number `attempt` with jitter applied, capped at
    /// `max_backoff`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let extra = base.mul_f64(rand::rng().random_range(0.0..=jitter));
        base.saturating_add(extra).min(self.max_backoff)
    }
}

/// Log output format of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Environment and command-line settings of the demo binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "switchboard-demo")]
#[command(
    about = "Declares the sample exchange topology, publishes test messages and consumes them"
)]
#[command(version)]
pub struct BrokerSettings {
    /// Broker hostname
    #[arg(long, env = "RABBITMQ_HOST", default_value = "localhost")]
    pub host: String,

    /// Broker port
    #[arg(long, env = "RABBITMQ_PORT", default_value_t = 5672)]
    pub port: u16,

    /// Username
    #[arg(long, env = "RABBITMQ_USERNAME", default_value = "guest")]
    pub username: String,

    /// Password
    #[arg(long, env = "RABBITMQ_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    /// Connection timeout in milliseconds
    #[arg(long, env = "RABBITMQ_TIMEOUT_MS", default_value_t = 1_800_000)]
    pub timeout_ms: u64,

    /// Heartbeat interval in milliseconds, 0 disables heartbeats
    #[arg(long, env = "RABBITMQ_HEARTBEAT_MS", default_value_t = 60_000)]
    pub heartbeat_ms: u64,

    /// Log output format
    #[arg(long, env = "SWITCHBOARD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SWITCHBOARD_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Exit after the test messages are consumed instead of waiting for a signal
    #[arg(long)]
    pub once: bool,
}

impl BrokerSettings {
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    #[must_use]
    pub fn into_connection_config(self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: Endpoint::new(self.host, self.port),
            credentials: Credentials::new(self.username, self.password),
            timeout: Duration::from_millis(self.timeout_ms),
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            ..ConnectionConfig::default()
        }
    }
}
