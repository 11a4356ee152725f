use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use folio_pool::{CommandEngineConfig, PoolConfig};

use crate::engine::DispatchConfig;

/// Configuration could not be read from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse.
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format, selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

/// Liveness limits for persistent sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often every session is pinged.
    pub ping_interval: Duration,
    /// Sessions that send nothing at all (not even a pong) for this long
    /// are closed.
    pub silence_timeout: Duration,
    /// Sessions that submit no calls for this long are closed.
    pub max_inactivity: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            silence_timeout: Duration::from_secs(90),
            max_inactivity: Duration::from_secs(30 * 60),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `120`).
    pub request_timeout_secs: u64,
    /// Upper bound on the post-shutdown cleanup (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    pub engine: CommandEngineConfig,
    /// Root directory of the local storage sink.
    pub storage_dir: PathBuf,
    /// Prefix of every output URL handed back to callers.
    pub public_base_url: String,
    /// Postgres connection string. Without it the server runs on the
    /// in-memory ledger and `STATIC_API_KEYS`.
    pub database_url: Option<String>,
    /// Development keys in `key:tier[:quota],...` form.
    pub static_api_keys: Option<String>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".into()],
            request_timeout_secs: 120,
            shutdown_timeout_secs: 30,
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            session: SessionConfig::default(),
            engine: CommandEngineConfig::default(),
            storage_dir: PathBuf::from("./data/output"),
            public_base_url: "http://localhost:3000".into(),
            database_url: None,
            static_api_keys: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                   |
    /// |---------------------------------|---------------------------|
    /// | `HOST`                          | `0.0.0.0`                 |
    /// | `PORT`                          | `3000`                    |
    /// | `CORS_ORIGINS`                  | `http://localhost:5173`   |
    /// | `REQUEST_TIMEOUT_SECS`          | `120`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`         | `30`                      |
    /// | `POOL_MIN_SIZE`                 | `8`                       |
    /// | `POOL_MAX_SIZE`                 | `16`                      |
    /// | `POOL_IDLE_TIMEOUT_SECS`        | `300`                     |
    /// | `POOL_MAX_AGE_SECS`             | `1800`                    |
    /// | `POOL_MAX_USES`                 | `500`                     |
    /// | `POOL_SWEEP_INTERVAL_SECS`      | `30`                      |
    /// | `POOL_TEARDOWN_AFTER_SECS`      | `1800`                    |
    /// | `ACQUIRE_TIMEOUT_MS`            | `10000`                   |
    /// | `RENDER_TIMEOUT_SECS`           | `30`                      |
    /// | `MAX_BATCH_SIZE`                | `100`                     |
    /// | `SESSION_PING_INTERVAL_SECS`    | `30`                      |
    /// | `SESSION_SILENCE_TIMEOUT_SECS`  | `90`                      |
    /// | `SESSION_MAX_INACTIVITY_SECS`   | `1800`                    |
    /// | `CHROME_BIN`                    | `chromium`                |
    /// | `WORKER_SCRATCH_DIR`            | system temp dir           |
    /// | `STORAGE_DIR`                   | `./data/output`           |
    /// | `PUBLIC_BASE_URL`               | `http://localhost:3000`   |
    /// | `DATABASE_URL`                  | unset                     |
    /// | `STATIC_API_KEYS`               | unset                     |
    /// | `LOG_FORMAT`                    | `pretty`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let cors_origins = match env.get("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };

        let pool = PoolConfig {
            min_size: env.parse("POOL_MIN_SIZE", defaults.pool.min_size)?,
            max_size: env.parse("POOL_MAX_SIZE", defaults.pool.max_size)?,
            idle_timeout: env.secs("POOL_IDLE_TIMEOUT_SECS", defaults.pool.idle_timeout)?,
            max_age: env.secs("POOL_MAX_AGE_SECS", defaults.pool.max_age)?,
            max_uses: env.parse("POOL_MAX_USES", defaults.pool.max_uses)?,
            sweep_interval: env.secs("POOL_SWEEP_INTERVAL_SECS", defaults.pool.sweep_interval)?,
            teardown_after: env.secs("POOL_TEARDOWN_AFTER_SECS", defaults.pool.teardown_after)?,
            ..defaults.pool
        }
        .normalized();

        let acquire_timeout_ms: u64 = env.parse(
            "ACQUIRE_TIMEOUT_MS",
            defaults.dispatch.acquire_timeout.as_millis() as u64,
        )?;
        let dispatch = DispatchConfig {
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            render_timeout: env.secs("RENDER_TIMEOUT_SECS", defaults.dispatch.render_timeout)?,
            max_batch_size: env.parse("MAX_BATCH_SIZE", defaults.dispatch.max_batch_size)?,
        };

        let session = SessionConfig {
            ping_interval: env.secs("SESSION_PING_INTERVAL_SECS", defaults.session.ping_interval)?,
            silence_timeout: env.secs(
                "SESSION_SILENCE_TIMEOUT_SECS",
                defaults.session.silence_timeout,
            )?,
            max_inactivity: env.secs(
                "SESSION_MAX_INACTIVITY_SECS",
                defaults.session.max_inactivity,
            )?,
        };

        let engine = CommandEngineConfig {
            binary: env
                .get("CHROME_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.engine.binary),
            scratch_dir: env.get("WORKER_SCRATCH_DIR").map(PathBuf::from),
            ..defaults.engine
        };

        let public_base_url = env
            .get("PUBLIC_BASE_URL")
            .unwrap_or(defaults.public_base_url)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            host: env.get("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT", defaults.port)?,
            cors_origins,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            shutdown_timeout_secs: env
                .parse("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout_secs)?,
            pool,
            dispatch,
            session,
            engine,
            storage_dir: env
                .get("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            public_base_url,
            database_url: env.get("DATABASE_URL"),
            static_api_keys: env.get("STATIC_API_KEYS"),
            log_format: env.parse("LOG_FORMAT", defaults.log_format)?,
        })
    }
}

/// Variable source with typed accessors. Empty values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(value) => {
                let parsed = value.trim().parse::<T>();
                parsed.map_err(|e| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                    value,
                })
            }
            None => Ok(default),
        }
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }
}
