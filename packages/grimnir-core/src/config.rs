//! Runtime configuration loaded from the environment.
//!
//! `GRIMNIR_*` keys are authoritative; each key also honors a legacy `RLM_*`
//! alias read by older deployments. Validation failures are typed so the
//! binary can exit non-zero at boot instead of limping along half-configured.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol_constants::{HARBOR_DEFAULT_MAX_SOURCES, HARBOR_DEFAULT_PORT};

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("Missing required configuration: {0}")]
    MissingKey(&'static str),

    /// A key is present but unparseable.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    /// `GRIMNIR_DB_BACKEND` is not one of postgres/mysql/sqlite.
    #[error("Invalid database backend: {0:?} (expected postgres, mysql or sqlite)")]
    InvalidBackend(String),

    /// The selected backend is valid but not wired in this build.
    #[error("Database backend {0:?} is not enabled in this build")]
    BackendNotEnabled(&'static str),

    /// A TURN URL is configured in production without credentials.
    #[error("TURN URL is set but TURN credentials are missing (production)")]
    TurnCredentialsMissing,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeEnv {
    #[default]
    Development,
    Production,
}

impl FromStr for RuntimeEnv {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            _ => Err(()),
        }
    }
}

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Postgres,
    Mysql,
    Sqlite,
}

impl FromStr for DbBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(()),
        }
    }
}

/// Harbor (live ingest) configuration.
#[derive(Debug, Clone)]
pub struct HarborConfig {
    /// Whether the harbor listener is started at all.
    pub enabled: bool,
    /// Address the harbor binds to.
    pub bind: IpAddr,
    /// Port the harbor binds to.
    pub port: u16,
    /// Hostname advertised to DJ clients (falls back to the HTTP host).
    pub host: Option<String>,
    /// Externally visible port when the harbor sits behind a proxy.
    pub public_port: Option<u16>,
    /// Optional path prefix stripped from mount paths (e.g. `/harbor`).
    pub mount_prefix: Option<String>,
    /// Cap on concurrent source connections; 503 above this.
    pub max_sources: usize,
}

/// Multi-instance coordination configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Best-effort leader election via the external coordinator.
    pub leader_election_enabled: bool,
    /// Redis address for the remote event bus and leader election.
    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    /// Stable identifier of this instance on the event bus.
    pub instance_id: String,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: RuntimeEnv,
    pub http_bind: IpAddr,
    pub http_port: u16,
    pub base_url: String,
    pub db_backend: DbBackend,
    pub db_dsn: String,
    pub media_root: PathBuf,
    pub jwt_signing_key: String,
    pub harbor: HarborConfig,
    pub cluster: ClusterConfig,
    /// Base URL of the media engine RPC surface; absent means the engine is
    /// not connected and executors run state-only.
    pub media_engine_url: Option<String>,
    /// Command template for the harbor decoder subprocess. `{rate}` and
    /// `{channels}` are substituted from the target mount.
    pub decoder_command: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

impl Config {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Split out from [`Config::from_env`] so tests can exercise the full
    /// parsing and validation path without mutating process environment.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |grimnir_key: &str| -> Option<String> {
            lookup(grimnir_key).or_else(|| {
                let legacy = grimnir_key.replacen("GRIMNIR_", "RLM_", 1);
                lookup(&legacy)
            })
        };

        let env = match get("GRIMNIR_ENV") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue {
                    key: "GRIMNIR_ENV",
                    value: raw,
                })?,
            None => RuntimeEnv::default(),
        };

        let http_bind = parse_or(get("GRIMNIR_HTTP_BIND"), "GRIMNIR_HTTP_BIND", [0, 0, 0, 0].into())?;
        let http_port = parse_or(get("GRIMNIR_HTTP_PORT"), "GRIMNIR_HTTP_PORT", 8000u16)?;
        let base_url = get("GRIMNIR_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{http_port}"));

        let db_backend = match get("GRIMNIR_DB_BACKEND") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidBackend(raw))?,
            None => DbBackend::Postgres,
        };
        let db_dsn = get("GRIMNIR_DB_DSN").ok_or(ConfigError::MissingKey("GRIMNIR_DB_DSN"))?;
        let jwt_signing_key = get("GRIMNIR_JWT_SIGNING_KEY")
            .ok_or(ConfigError::MissingKey("GRIMNIR_JWT_SIGNING_KEY"))?;
        let media_root = get("GRIMNIR_MEDIA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("media"));

        let harbor = HarborConfig {
            enabled: parse_or(get("GRIMNIR_HARBOR_ENABLED"), "GRIMNIR_HARBOR_ENABLED", true)?,
            bind: parse_or(get("GRIMNIR_HARBOR_BIND"), "GRIMNIR_HARBOR_BIND", [0, 0, 0, 0].into())?,
            port: parse_or(get("GRIMNIR_HARBOR_PORT"), "GRIMNIR_HARBOR_PORT", HARBOR_DEFAULT_PORT)?,
            host: get("GRIMNIR_HARBOR_HOST"),
            public_port: match get("GRIMNIR_HARBOR_PUBLIC_PORT") {
                Some(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "GRIMNIR_HARBOR_PUBLIC_PORT",
                    value: raw,
                })?),
                None => None,
            },
            mount_prefix: get("GRIMNIR_HARBOR_MOUNT_PREFIX"),
            max_sources: parse_or(
                get("GRIMNIR_HARBOR_MAX_SOURCES"),
                "GRIMNIR_HARBOR_MAX_SOURCES",
                HARBOR_DEFAULT_MAX_SOURCES,
            )?,
        };

        let cluster = ClusterConfig {
            leader_election_enabled: parse_or(
                get("GRIMNIR_LEADER_ELECTION_ENABLED"),
                "GRIMNIR_LEADER_ELECTION_ENABLED",
                false,
            )?,
            redis_addr: get("GRIMNIR_REDIS_ADDR"),
            redis_password: get("GRIMNIR_REDIS_PASSWORD"),
            redis_db: parse_or(get("GRIMNIR_REDIS_DB"), "GRIMNIR_REDIS_DB", 0i64)?,
            instance_id: get("GRIMNIR_INSTANCE_ID")
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let decoder_command = match get("GRIMNIR_HARBOR_DECODER_COMMAND") {
            Some(raw) => raw.split_whitespace().map(str::to_owned).collect(),
            None => default_decoder_command(),
        };

        let config = Self {
            env,
            http_bind,
            http_port,
            base_url,
            db_backend,
            db_dsn,
            media_root,
            jwt_signing_key,
            harbor,
            cluster,
            media_engine_url: get("GRIMNIR_MEDIA_ENGINE_URL"),
            decoder_command,
            turn_url: get("GRIMNIR_TURN_URL"),
            turn_username: get("GRIMNIR_TURN_USERNAME"),
            turn_password: get("GRIMNIR_TURN_PASSWORD"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.env == RuntimeEnv::Production
            && self.turn_url.is_some()
            && (self.turn_username.is_none() || self.turn_password.is_none())
        {
            return Err(ConfigError::TurnCredentialsMissing);
        }
        Ok(())
    }

    /// Whether the remote event bus should be brought up.
    pub fn remote_bus_enabled(&self) -> bool {
        self.cluster.redis_addr.is_some()
    }
}

/// Decoder used when none is configured: ffmpeg, compressed stdin to
/// interleaved s16le PCM on stdout.
fn default_decoder_command() -> Vec<String> {
    [
        "ffmpeg", "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-f", "s16le", "-ar",
        "{rate}", "-ac", "{channels}", "pipe:1",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn parse_or<T: FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(raw) => parse_flexible(&raw)
            .ok_or(ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Parses a value, accepting `1`/`0`/`yes`/`no`/`on`/`off` for booleans the
/// way the legacy loader did.
fn parse_flexible<T: FromStr>(raw: &str) -> Option<T> {
    if let Ok(value) = raw.parse() {
        return Some(value);
    }
    // Booleans get a second chance with the legacy spellings.
    let normalized = match raw.to_ascii_lowercase().as_str() {
        "1" | "yes" | "on" => "true",
        "0" | "no" | "off" => "false",
        _ => return None,
    };
    normalized.parse().ok()
}
