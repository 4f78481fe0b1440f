use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "TUTOR_RTC_";

/// Public STUN server used when no TURN credentials can be obtained.
pub const DEFAULT_FALLBACK_STUN: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SIGNALING_TABLE: &str = "signaling_messages";

/// Runtime configuration for the video-session core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential service returning `{"iceServers": [...]}`.
    pub ice_endpoint: Option<Url>,
    pub ice_api_key: Option<String>,
    pub ice_timeout: Duration,
    pub fallback_stun: String,
    /// Row endpoint base of the signaling store.
    pub signaling_url: Option<Url>,
    pub signaling_key: Option<String>,
    pub signaling_table: String,
    pub poll_interval: Duration,
    /// How long a `disconnected` connection may take to recover before the UI is told it is offline.
    pub disconnect_grace: Duration,
    pub recordings_dir: PathBuf,
    pub logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_endpoint: None,
            ice_api_key: None,
            ice_timeout: Duration::from_millis(5_000),
            fallback_stun: DEFAULT_FALLBACK_STUN.to_string(),
            signaling_url: None,
            signaling_key: None,
            signaling_table: DEFAULT_SIGNALING_TABLE.to_string(),
            poll_interval: Duration::from_millis(250),
            disconnect_grace: Duration::from_secs(10),
            recordings_dir: PathBuf::from("recordings"),
            // logging is on in debug builds unless switched off explicitly
            logging: cfg!(debug_assertions),
        }
    }
}

impl Config {
    /// Reads `TUTOR_RTC_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Config::default();
        if let Some(v) = get("ICE_ENDPOINT") {
            config.ice_endpoint = Some(parse("ICE_ENDPOINT", &v)?);
        }
        config.ice_api_key = get("ICE_API_KEY");
        if let Some(v) = get("ICE_TIMEOUT_MS") {
            config.ice_timeout = Duration::from_millis(parse("ICE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("FALLBACK_STUN") {
            config.fallback_stun = v;
        }
        if let Some(v) = get("SIGNALING_URL") {
            config.signaling_url = Some(parse("SIGNALING_URL", &v)?);
        }
        config.signaling_key = get("SIGNALING_KEY");
        if let Some(v) = get("SIGNALING_TABLE") {
            config.signaling_table = v;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse("POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("DISCONNECT_GRACE_MS") {
            config.disconnect_grace = Duration::from_millis(parse("DISCONNECT_GRACE_MS", &v)?);
        }
        if let Some(v) = get("RECORDINGS_DIR") {
            config.recordings_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOGGING") {
            config.logging = parse_flag("LOGGING", &v)?;
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        assert!(config.ice_endpoint.is_none());
        assert_eq!(config.fallback_stun, DEFAULT_FALLBACK_STUN);
        assert_eq!(config.signaling_table, DEFAULT_SIGNALING_TABLE);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.disconnect_grace, Duration::from_secs(10));
    }

    #[test]
    fn reads_prefixed_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TUTOR_RTC_ICE_ENDPOINT", "https://example.test/functions/v1/turn"),
            ("TUTOR_RTC_ICE_TIMEOUT_MS", "1500"),
            ("TUTOR_RTC_SIGNALING_TABLE", "rtc_rows"),
            ("TUTOR_RTC_LOGGING", "off"),
            ("TUTOR_RTC_ICE_API_KEY", "   "),
        ]))
        .expect("config");
        assert_eq!(
            config.ice_endpoint.as_ref().map(Url::as_str),
            Some("https://example.test/functions/v1/turn")
        );
        assert_eq!(config.ice_timeout, Duration::from_millis(1500));
        assert_eq!(config.signaling_table, "rtc_rows");
        assert!(!config.logging);
        assert!(config.ice_api_key.is_none());
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = Config::from_lookup(lookup(&[("TUTOR_RTC_POLL_INTERVAL_MS", "soon")]))
            .expect_err("must fail");
        match err {
            ConfigError::Invalid { key, value } => {
                assert_eq!(key, "TUTOR_RTC_POLL_INTERVAL_MS");
                assert_eq!(value, "soon");
            }
        }
    }
}
