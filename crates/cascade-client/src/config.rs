// Connection identity and policy configuration, with env/YAML overrides
// for the policy knobs.
use cascade_wire::TransportKind;
use serde::Deserialize;
use std::fs;

use crate::error::{ClientError, Result};

pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 4_000;
pub(crate) const DEFAULT_FIRST_RETRY_MAX_DELAY_MS: u64 = 100;
pub(crate) const DEFAULT_STALLED_TIMEOUT_MS: u64 = 2_000;
pub(crate) const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 3_000;
pub(crate) const DEFAULT_SESSION_RECOVERY_TIMEOUT_MS: u64 = 15_000;
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 19_000;
pub(crate) const DEFAULT_STREAM_SENSE_TIMEOUT_MS: u64 = 4_000;
pub(crate) const DEFAULT_CONTENT_LENGTH: u64 = 50_000_000;
// Consecutive failures double the retry delay up to this bound.
pub(crate) const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Requested session bandwidth, marshaled as "unlimited" or a decimal
/// kbps figure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxBandwidth {
    Unlimited,
    Limited(f64),
}

impl MaxBandwidth {
    pub fn as_token(&self) -> String {
        match self {
            MaxBandwidth::Unlimited => "unlimited".to_string(),
            MaxBandwidth::Limited(kbps) => format!("{kbps}"),
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        if token.eq_ignore_ascii_case("unlimited") {
            return Ok(MaxBandwidth::Unlimited);
        }
        let kbps: f64 = token
            .parse()
            .map_err(|_| ClientError::argument(format!("invalid bandwidth: {token}")))?;
        if kbps <= 0.0 {
            return Err(ClientError::argument("bandwidth must be positive"));
        }
        Ok(MaxBandwidth::Limited(kbps))
    }
}

/// Who to connect as, and what the server told us about the session.
/// The server-assigned fields are written back by the engine only.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDetails {
    pub server_address: Option<String>,
    pub adapter_set: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    // Server-assigned, cleared on terminal disconnect.
    pub session_id: Option<String>,
    pub server_instance_address: Option<String>,
    pub server_socket_name: Option<String>,
    pub client_ip: Option<String>,
}

/// Policy knobs, all in milliseconds unless stated otherwise.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub content_length: u64,
    pub first_retry_max_delay: u64,
    pub forced_transport: Option<TransportKind>,
    pub http_extra_headers: Vec<(String, String)>,
    pub http_extra_headers_on_session_creation_only: bool,
    pub idle_timeout: u64,
    pub keepalive_interval: u64,
    pub polling_interval: u64,
    pub reconnect_timeout: u64,
    pub requested_max_bandwidth: MaxBandwidth,
    // Authoritative value pushed by the server; read-only.
    pub real_max_bandwidth: Option<String>,
    pub retry_delay: u64,
    pub reverse_heartbeat_interval: u64,
    pub session_recovery_timeout: u64,
    pub slowing_enabled: bool,
    pub stalled_timeout: u64,
    pub stream_sense_timeout: u64,
    pub server_instance_address_ignored: bool,
    pub cookie_handling_required: bool,
    pub proxy: Option<String>,
    pub certificate_pins: Vec<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            content_length: DEFAULT_CONTENT_LENGTH,
            first_retry_max_delay: DEFAULT_FIRST_RETRY_MAX_DELAY_MS,
            forced_transport: None,
            http_extra_headers: Vec::new(),
            http_extra_headers_on_session_creation_only: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_MS,
            keepalive_interval: 0,
            polling_interval: 0,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT_MS,
            requested_max_bandwidth: MaxBandwidth::Unlimited,
            real_max_bandwidth: None,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            reverse_heartbeat_interval: 0,
            session_recovery_timeout: DEFAULT_SESSION_RECOVERY_TIMEOUT_MS,
            slowing_enabled: false,
            stalled_timeout: DEFAULT_STALLED_TIMEOUT_MS,
            stream_sense_timeout: DEFAULT_STREAM_SENSE_TIMEOUT_MS,
            server_instance_address_ignored: false,
            cookie_handling_required: false,
            proxy: None,
            certificate_pins: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct OptionsOverride {
    retry_delay: Option<u64>,
    first_retry_max_delay: Option<u64>,
    stalled_timeout: Option<u64>,
    reconnect_timeout: Option<u64>,
    session_recovery_timeout: Option<u64>,
    stream_sense_timeout: Option<u64>,
    idle_timeout: Option<u64>,
    keepalive_interval: Option<u64>,
    polling_interval: Option<u64>,
    reverse_heartbeat_interval: Option<u64>,
    content_length: Option<u64>,
}

impl ConnectionOptions {
    /// Defaults, then `CASCADE_*` env vars, then an optional YAML file
    /// (path argument or `CASCADE_CLIENT_CONFIG`). Zero or unparsable
    /// values are ignored in favor of the previous layer, except for the
    /// interval knobs where zero is meaningful.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut options = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("CASCADE_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: OptionsOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut options);
        }
        Ok(options)
    }

    fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = read_u64_env("CASCADE_RETRY_DELAY_MS") {
            options.retry_delay = value;
        }
        if let Some(value) = read_u64_env("CASCADE_FIRST_RETRY_MAX_DELAY_MS") {
            options.first_retry_max_delay = value;
        }
        if let Some(value) = read_u64_env("CASCADE_STALLED_TIMEOUT_MS") {
            options.stalled_timeout = value;
        }
        if let Some(value) = read_u64_env("CASCADE_RECONNECT_TIMEOUT_MS") {
            options.reconnect_timeout = value;
        }
        if let Some(value) = read_u64_env("CASCADE_SESSION_RECOVERY_TIMEOUT_MS") {
            options.session_recovery_timeout = value;
        }
        if let Some(value) = read_u64_env("CASCADE_STREAM_SENSE_TIMEOUT_MS") {
            options.stream_sense_timeout = value;
        }
        if let Some(value) = read_u64_env("CASCADE_IDLE_TIMEOUT_MS") {
            options.idle_timeout = value;
        }
        if let Some(value) = read_u64_env("CASCADE_CONTENT_LENGTH") {
            options.content_length = value;
        }
        options
    }
}

impl OptionsOverride {
    fn apply(&self, options: &mut ConnectionOptions) {
        if let Some(value) = self.retry_delay
            && value > 0
        {
            options.retry_delay = value;
        }
        if let Some(value) = self.first_retry_max_delay
            && value > 0
        {
            options.first_retry_max_delay = value;
        }
        if let Some(value) = self.stalled_timeout
            && value > 0
        {
            options.stalled_timeout = value;
        }
        if let Some(value) = self.reconnect_timeout
            && value > 0
        {
            options.reconnect_timeout = value;
        }
        if let Some(value) = self.session_recovery_timeout {
            options.session_recovery_timeout = value;
        }
        if let Some(value) = self.stream_sense_timeout
            && value > 0
        {
            options.stream_sense_timeout = value;
        }
        if let Some(value) = self.idle_timeout
            && value > 0
        {
            options.idle_timeout = value;
        }
        if let Some(value) = self.keepalive_interval {
            options.keepalive_interval = value;
        }
        if let Some(value) = self.polling_interval {
            options.polling_interval = value;
        }
        if let Some(value) = self.reverse_heartbeat_interval {
            options.reverse_heartbeat_interval = value;
        }
        if let Some(value) = self.content_length
            && value > 0
        {
            options.content_length = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_policy() {
        let options = ConnectionOptions::default();
        assert_eq!(options.retry_delay, 4_000);
        assert_eq!(options.first_retry_max_delay, 100);
        assert_eq!(options.stalled_timeout, 2_000);
        assert_eq!(options.reconnect_timeout, 3_000);
        assert_eq!(options.session_recovery_timeout, 15_000);
        assert_eq!(options.idle_timeout, 19_000);
        assert_eq!(options.keepalive_interval, 0);
        assert_eq!(options.polling_interval, 0);
        assert!(matches!(
            options.requested_max_bandwidth,
            MaxBandwidth::Unlimited
        ));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_apply() {
        unsafe {
            std::env::set_var("CASCADE_RETRY_DELAY_MS", "9000");
            std::env::set_var("CASCADE_STALLED_TIMEOUT_MS", "0");
        }
        let options = ConnectionOptions::from_env_or_yaml(None).expect("options");
        assert_eq!(options.retry_delay, 9_000);
        // Zero is rejected; the default stays.
        assert_eq!(options.stalled_timeout, DEFAULT_STALLED_TIMEOUT_MS);
        unsafe {
            std::env::remove_var("CASCADE_RETRY_DELAY_MS");
            std::env::remove_var("CASCADE_STALLED_TIMEOUT_MS");
        }
    }

    #[test]
    #[serial_test::serial]
    fn yaml_overrides_apply_over_env() {
        let yaml = r#"
retry_delay: 1234
keepalive_interval: 0
session_recovery_timeout: 0
"#;
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        let path = file.path().to_str().expect("path");

        let options = ConnectionOptions::from_env_or_yaml(Some(path)).expect("options");
        assert_eq!(options.retry_delay, 1_234);
        // Zero is meaningful for interval knobs.
        assert_eq!(options.keepalive_interval, 0);
        // And for disabling session recovery outright.
        assert_eq!(options.session_recovery_timeout, 0);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"retry_delay: [oops").expect("write");
        let path = file.path().to_str().expect("path");
        assert!(ConnectionOptions::from_env_or_yaml(Some(path)).is_err());
    }

    #[test]
    fn bandwidth_tokens() {
        assert_eq!(MaxBandwidth::Unlimited.as_token(), "unlimited");
        assert_eq!(MaxBandwidth::Limited(40.0).as_token(), "40");
        assert!(matches!(
            MaxBandwidth::parse("UNLIMITED").expect("parse"),
            MaxBandwidth::Unlimited
        ));
        assert!(MaxBandwidth::parse("-2").is_err());
        assert!(MaxBandwidth::parse("fast").is_err());
    }
}
