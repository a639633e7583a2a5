//! Environment-backed configuration for `chat-smoke`.

use std::{env, error::Error, fmt, path::PathBuf};

use chat_core::ChatInitConfig;

const DEFAULT_USER_ID: &str = "chat-smoke-user";
const DEFAULT_SESSION_ID: &str = "default";
const DEFAULT_SESSION_DIR: &str = "./.chat-smoke-sessions";
const LOOPBACK_SECRET: &str = "loopback-secret";

/// Where the smoke run sends its traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChoice {
    /// In-process echo agent.
    Loopback,
    /// Live DirectLine service.
    DirectLine {
        /// Overrides the public DirectLine endpoint.
        domain: Option<String>,
    },
}

/// Runtime configuration used by the smoke binary.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    pub transport: TransportChoice,
    /// Secret or token handed to `ChatCommand::Start`.
    pub secret: String,
    pub user_id: String,
    pub session_id: String,
    /// Root directory of the JSONL session archive.
    pub session_dir: PathBuf,
    /// Runtime tuning; fields left unset fall back to runtime defaults.
    pub init: ChatInitConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let secret = optional_trimmed_env("DIRECTLINE_SECRET", &mut lookup);
        let domain = optional_trimmed_env("DIRECTLINE_DOMAIN", &mut lookup);
        let loopback = parse_optional_bool("CHAT_LOOPBACK", &mut lookup)?.unwrap_or(secret.is_none());

        let (transport, secret) = match (loopback, secret) {
            (true, secret) => (
                TransportChoice::Loopback,
                secret.unwrap_or_else(|| LOOPBACK_SECRET.to_owned()),
            ),
            (false, Some(secret)) => (TransportChoice::DirectLine { domain }, secret),
            (false, None) => return Err(ConfigError::Missing { key: "DIRECTLINE_SECRET" }),
        };

        let user_id = optional_trimmed_env("DIRECTLINE_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());
        let session_id = optional_trimmed_env("CHAT_SESSION_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_owned());
        let session_dir = optional_trimmed_env("CHAT_SESSION_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_DIR));

        let init = ChatInitConfig {
            connect_timeout_ms: parse_optional_u64("CHAT_CONNECT_TIMEOUT_MS", &mut lookup)?,
            max_clock_skew_secs: parse_optional_u64("CHAT_MAX_CLOCK_SKEW_SECS", &mut lookup)?,
            timeline_max_items: parse_optional_usize("CHAT_TIMELINE_MAX_ITEMS", &mut lookup)?,
            reveal_ceiling_ms: parse_optional_u64("CHAT_REVEAL_CEILING_MS", &mut lookup)?,
            simulate_streaming: parse_optional_bool("CHAT_SIMULATE_STREAMING", &mut lookup)?,
        };

        if init.connect_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_CONNECT_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if init.timeline_max_items == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            transport,
            secret,
            user_id,
            session_id,
            session_dir,
            init,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is not set.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "missing {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    lookup: &mut F,
) -> Result<Option<usize>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_to_loopback_without_secret() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.transport, TransportChoice::Loopback);
        assert_eq!(cfg.secret, LOOPBACK_SECRET);
        assert_eq!(cfg.user_id, DEFAULT_USER_ID);
        assert_eq!(cfg.session_id, DEFAULT_SESSION_ID);
        assert_eq!(cfg.session_dir, PathBuf::from(DEFAULT_SESSION_DIR));
        assert_eq!(cfg.init, ChatInitConfig::default());
    }

    #[test]
    fn secret_selects_directline() {
        let cfg = config_from_pairs(&[
            ("DIRECTLINE_SECRET", "  sk-live-123  "),
            ("DIRECTLINE_DOMAIN", "https://europe.directline.botframework.com/v3/directline"),
            ("DIRECTLINE_USER_ID", "dl_alice"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.secret, "sk-live-123");
        assert_eq!(cfg.user_id, "dl_alice");
        assert_eq!(
            cfg.transport,
            TransportChoice::DirectLine {
                domain: Some("https://europe.directline.botframework.com/v3/directline".into()),
            }
        );
    }

    #[test]
    fn explicit_loopback_overrides_secret() {
        let cfg = config_from_pairs(&[("DIRECTLINE_SECRET", "sk-live-123"), ("CHAT_LOOPBACK", "yes")])
            .expect("config should parse");
        assert_eq!(cfg.transport, TransportChoice::Loopback);
        assert_eq!(cfg.secret, "sk-live-123");
    }

    #[test]
    fn directline_without_secret_is_rejected() {
        let err = config_from_pairs(&[("CHAT_LOOPBACK", "false")]).expect_err("must fail");
        assert_eq!(err, ConfigError::Missing { key: "DIRECTLINE_SECRET" });
    }

    #[test]
    fn parses_runtime_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("CHAT_CONNECT_TIMEOUT_MS", "5000"),
            ("CHAT_MAX_CLOCK_SKEW_SECS", "600"),
            ("CHAT_TIMELINE_MAX_ITEMS", "200"),
            ("CHAT_REVEAL_CEILING_MS", "1500"),
            ("CHAT_SIMULATE_STREAMING", "off"),
            ("CHAT_SESSION_DIR", "/tmp/chat"),
            ("CHAT_SESSION_ID", "support-42"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.init.connect_timeout_ms, Some(5_000));
        assert_eq!(cfg.init.max_clock_skew_secs, Some(600));
        assert_eq!(cfg.init.timeline_max_items, Some(200));
        assert_eq!(cfg.init.reveal_ceiling_ms, Some(1_500));
        assert_eq!(cfg.init.simulate_streaming, Some(false));
        assert_eq!(cfg.session_dir, PathBuf::from("/tmp/chat"));
        assert_eq!(cfg.session_id, "support-42");
    }

    #[test]
    fn rejects_invalid_numbers_and_flags() {
        let err = config_from_pairs(&[("CHAT_CONNECT_TIMEOUT_MS", "soon")]).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_CONNECT_TIMEOUT_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("CHAT_SIMULATE_STREAMING", "maybe")]).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_SIMULATE_STREAMING",
                ..
            }
        ));

        let err = config_from_pairs(&[("CHAT_TIMELINE_MAX_ITEMS", "0")]).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "invalid CHAT_TIMELINE_MAX_ITEMS='0': must be at least 1"
        );
    }
}
