use base64::{engine::general_purpose, Engine as _};
use directories::ProjectDirs;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};

use crate::error::ConfigError;

pub const ENV_TOKEN_LIFETIME: &str = "P2P_TOKEN_LIFETIME";
pub const ENV_NOTIFICATION_WINDOW: &str = "P2P_NOTIFICATION_WINDOW";
pub const ENV_MAX_QUEUE_SIZE: &str = "P2P_MAX_QUEUE_SIZE";
pub const ENV_MAX_QUEUE_AGE: &str = "P2P_MAX_QUEUE_AGE";
pub const ENV_ROTATION_INTERVAL: &str = "P2P_ROTATION_INTERVAL";

/// Prefix the same settings carried in earlier releases. Read only when the
/// `P2P_` name is unset.
pub const LEGACY_ENV_PREFIX: &str = "N0CTUA_";

const TOKEN_LIFETIME_BOUNDS: (u64, u64) = (5, 300);
const NOTIFICATION_WINDOW_BOUNDS: (u64, u64) = (5, 60);
const MAX_QUEUE_SIZE_BOUNDS: (u64, u64) = (10, 1000);
const MAX_QUEUE_AGE_BOUNDS: (u64, u64) = (10, 300);
const ROTATION_INTERVAL_BOUNDS: (u64, u64) = (300, 7200);

/// Process-wide session settings. All durations are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a transition token stays redeemable
    pub token_lifetime: u64,
    /// Informational only; no behaviour depends on it yet
    pub notification_window: u64,
    /// Maximum queued messages per session during rotation
    pub max_queue_size: usize,
    /// Queued messages older than this are dropped on drain
    pub max_queue_age: u64,
    /// Session age at which the next send rotates it
    pub rotation_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_lifetime: 30,
            notification_window: 10,
            max_queue_size: 100,
            max_queue_age: 30,
            rotation_interval: 1800,
        }
    }
}

impl SessionConfig {
    /// Load from `.env` files and the process environment, then validate.
    ///
    /// A `.env` in the working directory wins over the one in the platform
    /// config directory; real environment variables win over both.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        if let Some(proj_dirs) = ProjectDirs::from("com", "p2p-secure-chat", "p2p-secure-chat") {
            let env_path = proj_dirs.config_dir().join(".env");
            if env_path.exists() {
                debug!(path = %env_path.display(), "loading session settings");
                let _ = dotenv::from_path(env_path);
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = parse_var(&lookup, ENV_TOKEN_LIFETIME)? {
            config.token_lifetime = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_NOTIFICATION_WINDOW)? {
            config.notification_window = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_QUEUE_SIZE)? {
            config.max_queue_size = usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
                var: ENV_MAX_QUEUE_SIZE.to_string(),
                value: value.to_string(),
            })?;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_QUEUE_AGE)? {
            config.max_queue_age = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_ROTATION_INTERVAL)? {
            config.rotation_interval = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject any value outside its hard bounds. Values are never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("token_lifetime", self.token_lifetime, TOKEN_LIFETIME_BOUNDS)?;
        check(
            "notification_window",
            self.notification_window,
            NOTIFICATION_WINDOW_BOUNDS,
        )?;
        check(
            "max_queue_size",
            self.max_queue_size as u64,
            MAX_QUEUE_SIZE_BOUNDS,
        )?;
        check("max_queue_age", self.max_queue_age, MAX_QUEUE_AGE_BOUNDS)?;
        check(
            "rotation_interval",
            self.rotation_interval,
            ROTATION_INTERVAL_BOUNDS,
        )?;
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, var: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let found = lookup(var).map(|raw| (var.to_string(), raw)).or_else(|| {
        let legacy = format!("{}{}", LEGACY_ENV_PREFIX, var.strip_prefix("P2P_")?);
        lookup(&legacy).map(|raw| (legacy, raw))
    });
    let Some((name, raw)) = found else {
        return Ok(None);
    };
    if name != var {
        debug!(var = %name, "using legacy setting name");
    }

    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue { var: name, value: raw })
}

fn check(key: &'static str, value: u64, (min, max): (u64, u64)) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

/// Identity and listening settings for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    /// Shared secret a connecting peer must present
    pub secret: String,
}

impl NodeConfig {
    /// Create a node configuration, generating whatever is not supplied.
    /// Port 0 lets the OS pick a free port.
    pub fn new(peer_id: Option<String>, host: Option<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.unwrap_or_else(generate_peer_id),
            host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            secret: generate_secret(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_id.trim().is_empty() {
            return Err(ConfigError::InvalidNode("peer id cannot be empty".to_string()));
        }
        if self.secret.is_empty() || self.secret.contains(':') {
            return Err(ConfigError::InvalidNode(
                "secret must be non-empty and cannot contain ':'".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(ConfigError::InvalidNode("host cannot be empty".to_string()));
        }
        if self.port != 0 && self.port < 1024 {
            warn!(port = self.port, "using a privileged port");
        }
        Ok(())
    }
}

/// `Peer_` followed by four hex characters
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    format!("Peer_{}", hex::encode(bytes))
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
