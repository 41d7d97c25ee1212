//! Session Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparsable value.
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },

    /// JSON configuration did not parse.
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Collision re-roll cap (None = unbounded).
    pub max_rerolls: Option<u32>,
    /// Give up on the election after this long (None = wait forever).
    #[serde(with = "optional_millis")]
    pub election_timeout: Option<Duration>,
    /// Event broadcast channel capacity.
    pub event_capacity: usize,
    /// Actor command channel capacity.
    pub command_capacity: usize,
    /// Drop moves that arrive outside `Active`.
    pub strict_moves: bool,
    /// Start the election as soon as every expected peer has connected.
    pub auto_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rerolls: Some(32),
            election_timeout: None,
            event_capacity: 256,
            command_capacity: 64,
            strict_moves: false,
            auto_start: true,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `DUET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `DUET_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("DUET_MAX_REROLLS") {
            config.max_rerolls = match value.as_str() {
                "none" | "unbounded" => None,
                v => Some(parse("DUET_MAX_REROLLS", v)?),
            };
        }
        if let Some(value) = lookup("DUET_ELECTION_TIMEOUT_MS") {
            let millis: u64 = parse("DUET_ELECTION_TIMEOUT_MS", &value)?;
            config.election_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(value) = lookup("DUET_EVENT_CAPACITY") {
            config.event_capacity = parse("DUET_EVENT_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("DUET_STRICT_MOVES") {
            config.strict_moves = parse_flag("DUET_STRICT_MOVES", &value)?;
        }
        if let Some(value) = lookup("DUET_AUTO_START") {
            config.auto_start = parse_flag("DUET_AUTO_START", &value)?;
        }

        Ok(config)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string. Missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        }),
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
