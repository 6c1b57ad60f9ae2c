//! Engine Configuration Settings
//!
//! Configuration types for the streaming engine. Every value has a default;
//! environment variables prefixed with `EXG_` override them. Unparsable
//! values fall back to the default.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::account::Credentials;
use crate::domain::orderbook::DEFAULT_DEPTH;
use crate::domain::streaming::StreamKind;
use crate::infrastructure::router::DropPolicy;

/// Account name used when a watch call does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Connection settings per endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of each connection's outbound frame queue.
    pub send_queue_capacity: usize,
    /// Bound on dialing an endpoint.
    pub connect_timeout: Duration,
    /// Maximum connections per public endpoint.
    pub max_conns_per_endpoint: usize,
    /// A connection below this many keys takes new subscriptions first.
    pub min_subs_per_conn: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            max_conns_per_endpoint: 20,
            min_subs_per_conn: 50,
        }
    }
}

/// Keepalive supervisor settings.
#[derive(Debug, Clone)]
pub struct KeepaliveSettings {
    /// Heartbeat ping interval.
    pub ping_interval: Duration,
    /// Whether silent subscriptions are resubscribed.
    pub stale_check: bool,
    /// How often subscription staleness is checked.
    pub stale_check_interval: Duration,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            stale_check: true,
            stale_check_interval: Duration::from_secs(10),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
    /// Attempts before an endpoint is given up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 10,
        }
    }
}

/// Output queue settings.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Capacity for kinds without an override.
    pub default_capacity: usize,
    /// Capacity per stream kind.
    pub capacities: HashMap<StreamKind, usize>,
    /// Overflow policy per stream kind.
    pub policies: HashMap<StreamKind, DropPolicy>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            default_capacity: 100,
            capacities: HashMap::from([(StreamKind::OrderBook, 1000)]),
            policies: HashMap::new(),
        }
    }
}

impl RouterSettings {
    /// Queue capacity for a stream kind.
    #[must_use]
    pub fn capacity_for(&self, kind: StreamKind) -> usize {
        self.capacities
            .get(&kind)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// Overflow policy for a stream kind.
    #[must_use]
    pub fn policy_for(&self, kind: StreamKind) -> DropPolicy {
        self.policies.get(&kind).copied().unwrap_or_default()
    }
}

/// Login settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// How long `ensure_login` waits for the login result.
    pub login_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(10),
        }
    }
}

/// Order book settings.
#[derive(Debug, Clone)]
pub struct OrderBookSettings {
    /// Depth used when a watch does not ask for one.
    pub default_depth: usize,
}

impl Default for OrderBookSettings {
    fn default() -> Self {
        Self {
            default_depth: DEFAULT_DEPTH,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection settings.
    pub connection: ConnectionSettings,
    /// Keepalive settings.
    pub keepalive: KeepaliveSettings,
    /// Reconnect settings.
    pub reconnect: ReconnectSettings,
    /// Output queue settings.
    pub router: RouterSettings,
    /// Login settings.
    pub auth: AuthSettings,
    /// Order book settings.
    pub order_book: OrderBookSettings,
    /// Credentials by account name.
    pub accounts: HashMap<String, Credentials>,
    /// Account used when a watch does not name one.
    pub default_account: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            keepalive: KeepaliveSettings::default(),
            reconnect: ReconnectSettings::default(),
            router: RouterSettings::default(),
            auth: AuthSettings::default(),
            order_book: OrderBookSettings::default(),
            accounts: HashMap::new(),
            default_account: DEFAULT_ACCOUNT.to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an account is only partially configured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a dotenv file, falling back to the process
    /// environment for keys the file does not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an account is only
    /// partially configured.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| ConfigError::EnvFile(format!("{}: {e}", path.display())))?;

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) =
                item.map_err(|e| ConfigError::EnvFile(format!("{}: {e}", path.display())))?;
            vars.insert(key, value);
        }

        Self::from_lookup(|key| vars.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    /// Create configuration from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns an error if an account is only partially configured.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let connection = ConnectionSettings {
            send_queue_capacity: env.usize(
                "EXG_SEND_QUEUE_CAPACITY",
                defaults.connection.send_queue_capacity,
            ),
            connect_timeout: env.duration_secs(
                "EXG_CONNECT_TIMEOUT_SECS",
                defaults.connection.connect_timeout,
            ),
            max_conns_per_endpoint: env.usize(
                "EXG_MAX_CONNS_PER_ENDPOINT",
                defaults.connection.max_conns_per_endpoint,
            ),
            min_subs_per_conn: env.usize(
                "EXG_MIN_SUBS_PER_CONN",
                defaults.connection.min_subs_per_conn,
            ),
        };

        let keepalive = KeepaliveSettings {
            ping_interval: env.duration_secs(
                "EXG_PING_INTERVAL_SECS",
                defaults.keepalive.ping_interval,
            ),
            stale_check: env.bool("EXG_STALE_CHECK", defaults.keepalive.stale_check),
            stale_check_interval: env.duration_secs(
                "EXG_STALE_CHECK_INTERVAL_SECS",
                defaults.keepalive.stale_check_interval,
            ),
        };

        let reconnect = ReconnectSettings {
            max_delay: env.duration_secs(
                "EXG_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect.max_delay,
            ),
            multiplier: env.f64(
                "EXG_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
            jitter: env.f64("EXG_RECONNECT_JITTER", defaults.reconnect.jitter),
            max_attempts: env.u32(
                "EXG_MAX_RECONNECT_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };

        let mut router = RouterSettings {
            default_capacity: env.usize("EXG_QUEUE_CAPACITY", defaults.router.default_capacity),
            ..defaults.router
        };
        for kind in StreamKind::all() {
            let prefix = format!("EXG_{}", kind.as_str().to_ascii_uppercase());
            if let Some(capacity) = env.parse::<usize>(&format!("{prefix}_QUEUE_CAPACITY")) {
                router.capacities.insert(*kind, capacity);
            }
            if let Some(policy) = env.parse::<DropPolicy>(&format!("{prefix}_DROP_POLICY")) {
                router.policies.insert(*kind, policy);
            }
        }

        let auth = AuthSettings {
            login_timeout: env.duration_secs("EXG_LOGIN_TIMEOUT_SECS", defaults.auth.login_timeout),
        };

        let order_book = OrderBookSettings {
            default_depth: env.usize("EXG_ORDERBOOK_DEPTH", defaults.order_book.default_depth),
        };

        let default_account = env
            .string("EXG_DEFAULT_ACCOUNT")
            .unwrap_or(defaults.default_account);

        let mut accounts = HashMap::new();
        if let Some(credentials) = env.credentials("EXG")? {
            accounts.insert(default_account.clone(), credentials);
        }
        if let Some(names) = env.string("EXG_ACCOUNTS") {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let prefix = format!("EXG_{}", name.to_ascii_uppercase());
                let credentials = env
                    .credentials(&prefix)?
                    .ok_or_else(|| ConfigError::MissingEnvVar(format!("{prefix}_API_KEY")))?;
                accounts.insert(name.to_string(), credentials);
            }
        }

        Ok(Self {
            connection,
            keepalive,
            reconnect,
            router,
            auth,
            order_book,
            accounts,
            default_account,
        })
    }

    /// Credentials for an account, or for the default account.
    #[must_use]
    pub fn credentials(&self, account: Option<&str>) -> Option<&Credentials> {
        self.accounts
            .get(account.unwrap_or(&self.default_account))
    }
}

/// Settings of the demo binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Exchange protocol name (`okx` or `bybit`).
    pub exchange: String,
    /// Unified symbols to watch.
    pub symbols: Vec<String>,
    /// Order book depth to request.
    pub depth: usize,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            exchange: "okx".to_string(),
            symbols: vec!["BTC/USDT".to_string()],
            depth: 5,
            metrics_port: 9090,
        }
    }
}

impl RunSettings {
    /// Create run settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create run settings from any key/value source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(&lookup);
        let defaults = Self::default();

        let symbols = env
            .string("EXG_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|symbols| !symbols.is_empty())
            .unwrap_or(defaults.symbols);

        Self {
            exchange: env
                .string("EXG_EXCHANGE")
                .map_or(defaults.exchange, |s| s.to_ascii_lowercase()),
            symbols,
            depth: env.usize("EXG_WATCH_DEPTH", defaults.depth),
            metrics_port: env.u16("EXG_METRICS_PORT", defaults.metrics_port),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// The dotenv file could not be read.
    #[error("failed to read env file {0}")]
    EnvFile(String),
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|v| v.parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.string(key)
            .map_or(default, |v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    /// Whole seconds; zero falls back to the default.
    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key)
            .filter(|secs| *secs > 0)
            .map_or(default, Duration::from_secs)
    }

    /// `{prefix}_API_KEY` / `_API_SECRET` / `_API_PASSPHRASE`.
    fn credentials(&self, prefix: &str) -> Result<Option<Credentials>, ConfigError> {
        let key_var = format!("{prefix}_API_KEY");
        let secret_var = format!("{prefix}_API_SECRET");

        let Some(raw_key) = (self.0)(&key_var) else {
            return Ok(None);
        };
        if raw_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key_var));
        }

        let secret = (self.0)(&secret_var).ok_or_else(|| ConfigError::MissingEnvVar(secret_var.clone()))?;
        if secret.trim().is_empty() {
            return Err(ConfigError::EmptyValue(secret_var));
        }

        let passphrase = self.string(&format!("{prefix}_API_PASSPHRASE"));
        Ok(Some(Credentials::new(
            raw_key.trim().to_string(),
            secret.trim().to_string(),
            passphrase,
        )))
    }
}
