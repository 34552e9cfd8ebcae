//! Configuration for the router and node services.
//!
//! Both services read a JSON config file (path from `--config` or the
//! `CONFIG` env var). String options holding secrets or deploy-specific
//! endpoints accept `$VAR` / `${VAR}` environment references through
//! [`LiteralOrEnv`], so key material never has to live in the file itself.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::identity::{Keys, Npub};

/// A transparent wrapper that resolves environment variables during
/// deserialization.
///
/// Supports literal values, `$VAR`, and `${VAR}` forms. Implements `Deref`
/// for transparent access to the inner value.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn new(inner: T) -> Self {
        LiteralOrEnv(inner)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the referenced variable name for `$VAR` / `${VAR}` syntax.
    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(stripped) = s.strip_prefix("${") {
            stripped.strip_suffix('}').map(str::to_owned)
        } else if let Some(stripped) = s.strip_prefix('$') {
            if !stripped.is_empty()
                && stripped.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                Some(stripped.to_owned())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

/// Relay-discovery policy applied when admitting node manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAdmissionConfig {
    #[serde(default)]
    pub require_snapshot: bool,
    #[serde(default = "defaults::manifest_max_age_ms")]
    pub max_age_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl Default for RelayAdmissionConfig {
    fn default() -> Self {
        RelayAdmissionConfig {
            require_snapshot: false,
            max_age_ms: defaults::manifest_max_age_ms(),
            min_score: None,
            max_results: None,
        }
    }
}

/// Peer federation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// This router's public base URL, advertised in capability profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
    #[serde(default)]
    pub peers: Vec<Url>,
    #[serde(default = "defaults::publish_interval_ms")]
    pub publish_interval_ms: u64,
    #[serde(default = "defaults::federation_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "defaults::rate_limit_window_ms")]
    pub rate_limit_window_ms: i64,
    #[serde(default = "defaults::federation_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "defaults::auction_concurrency")]
    pub auction_concurrency: usize,
    #[serde(default = "defaults::publish_concurrency")]
    pub publish_concurrency: usize,
    #[serde(default)]
    pub nostr_enabled: bool,
    #[serde(default = "defaults::nostr_subscribe_since_seconds")]
    pub nostr_subscribe_since_seconds: u64,
    #[serde(default = "defaults::max_privacy_level")]
    pub max_privacy_level: u8,
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            enabled: false,
            endpoint: None,
            peers: Vec::new(),
            publish_interval_ms: defaults::publish_interval_ms(),
            rate_limit_max: defaults::federation_rate_limit_max(),
            rate_limit_window_ms: defaults::rate_limit_window_ms(),
            request_timeout_ms: defaults::federation_request_timeout_ms(),
            auction_concurrency: defaults::auction_concurrency(),
            publish_concurrency: defaults::publish_concurrency(),
            nostr_enabled: false,
            nostr_subscribe_since_seconds: defaults::nostr_subscribe_since_seconds(),
            max_privacy_level: defaults::max_privacy_level(),
        }
    }
}

/// Invoice oracle endpoint and retry shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleEndpointConfig {
    pub url: LiteralOrEnv<Url>,
    #[serde(default = "defaults::oracle_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Payment verification oracle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVerificationConfig {
    pub url: LiteralOrEnv<Url>,
    #[serde(default = "defaults::oracle_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub require_preimage: bool,
    #[serde(default = "defaults::retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// TLS material paths. Termination itself happens in front of the service;
/// the options are recognized here so one config file can drive both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub require_client_cert: bool,
}

/// Which runner implementation a node drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    Mock,
    HttpGeneric,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Mock => "mock",
            RunnerKind::HttpGeneric => "http-generic",
        }
    }
}

/// Runner selection and its transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default = "defaults::runner_kind")]
    pub kind: RunnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<LiteralOrEnv<Url>>,
    #[serde(default = "defaults::runner_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            kind: defaults::runner_kind(),
            url: None,
            timeout_ms: defaults::runner_timeout_ms(),
        }
    }
}

/// Outbound sandboxing for the node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    #[default]
    Disabled,
    Restricted,
}

/// Router service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default = "defaults::router_port")]
    pub port: u16,
    #[serde(default = "defaults::host")]
    pub host: IpAddr,
    /// Router signing key: `nsec1…` or hex, or an env reference.
    pub secret_key: LiteralOrEnv<Keys>,

    #[serde(default)]
    pub require_payment: bool,
    #[serde(default)]
    pub client_allow_list: Vec<Npub>,
    #[serde(default)]
    pub client_mute_list: Vec<Npub>,
    #[serde(default)]
    pub client_block_list: Vec<Npub>,
    #[serde(default)]
    pub node_block_list: Vec<Npub>,
    #[serde(default)]
    pub node_mute_list: Vec<Npub>,

    #[serde(default)]
    pub relay_admission: RelayAdmissionConfig,
    #[serde(default)]
    pub federation: FederationConfig,

    #[serde(default)]
    pub router_fee_enabled: bool,
    #[serde(default)]
    pub router_fee_bps: u32,
    #[serde(default)]
    pub router_fee_flat_sats: u64,
    #[serde(default)]
    pub router_fee_min_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_fee_max_sats: Option<u64>,
    #[serde(default)]
    pub router_fee_split_enabled: bool,

    #[serde(default = "defaults::payment_request_retention_ms")]
    pub payment_request_retention_ms: i64,
    #[serde(default = "defaults::payment_receipt_retention_ms")]
    pub payment_receipt_retention_ms: i64,
    #[serde(default = "defaults::node_retention_ms")]
    pub node_retention_ms: i64,
    #[serde(default = "defaults::node_health_retention_ms")]
    pub node_health_retention_ms: i64,
    #[serde(default = "defaults::node_cooldown_retention_ms")]
    pub node_cooldown_retention_ms: i64,
    #[serde(default = "defaults::federation_job_retention_ms")]
    pub federation_job_retention_ms: i64,
    #[serde(default = "defaults::payment_reconcile_grace_ms")]
    pub payment_reconcile_grace_ms: i64,

    #[serde(default = "defaults::router_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "defaults::rate_limit_window_ms")]
    pub rate_limit_window_ms: i64,
    #[serde(default = "defaults::forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_provider: Option<OracleEndpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_verification: Option<PaymentVerificationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce_store_path: Option<PathBuf>,
}

/// Node service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default = "defaults::node_port")]
    pub port: u16,
    #[serde(default = "defaults::host")]
    pub host: IpAddr,
    /// Node signing key: `nsec1…` or hex, or an env reference.
    pub secret_key: LiteralOrEnv<Keys>,
    /// Stable node id; defaults to the npub when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Endpoint advertised at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
    /// Router to send registration heartbeats to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_url: Option<Url>,
    #[serde(default)]
    pub capabilities: Vec<crate::proto::Capability>,
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default = "defaults::capacity_max_concurrent")]
    pub capacity_max_concurrent: i64,
    #[serde(default)]
    pub capacity_current_load: i64,
    #[serde(default = "defaults::max_prompt_bytes")]
    pub max_prompt_bytes: usize,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "defaults::max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inference_ms: Option<u64>,

    /// Pinned router identity: inbound envelopes must carry exactly this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_key_id: Option<Npub>,
    /// Key that inbound envelope signatures must verify under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_public_key: Option<Npub>,
    #[serde(default)]
    pub router_allow_list: Vec<Npub>,
    #[serde(default)]
    pub router_follow_list: Vec<Npub>,
    #[serde(default)]
    pub router_mute_list: Vec<Npub>,
    #[serde(default)]
    pub router_block_list: Vec<Npub>,

    #[serde(default = "defaults::node_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "defaults::rate_limit_window_ms")]
    pub rate_limit_window_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce_store_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce_store_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_verification: Option<PaymentVerificationConfig>,
    #[serde(default)]
    pub require_payment: bool,

    #[serde(default)]
    pub sandbox_mode: SandboxMode,
    #[serde(default)]
    pub sandbox_allowed_runners: Vec<String>,
    #[serde(default)]
    pub sandbox_allowed_endpoints: Vec<String>,
}

impl NodeConfig {
    /// Effective node id.
    pub fn effective_node_id(&self) -> String {
        match &self.node_id {
            Some(id) => id.clone(),
            None => self.secret_key.npub().to_string(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load a typed config from a JSON file.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content =
        fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    let config = serde_json::from_str(&content)?;
    Ok(config)
}

pub mod defaults {
    use std::net::IpAddr;

    pub fn host() -> IpAddr {
        IpAddr::V4("0.0.0.0".parse().expect("static address"))
    }
    pub fn router_port() -> u16 {
        8080
    }
    pub fn node_port() -> u16 {
        8081
    }
    pub fn manifest_max_age_ms() -> i64 {
        10 * 60 * 1000
    }
    pub fn publish_interval_ms() -> u64 {
        30_000
    }
    pub fn federation_rate_limit_max() -> u32 {
        60
    }
    pub fn rate_limit_window_ms() -> i64 {
        60_000
    }
    pub fn federation_request_timeout_ms() -> u64 {
        10_000
    }
    pub fn auction_concurrency() -> usize {
        4
    }
    pub fn publish_concurrency() -> usize {
        4
    }
    pub fn nostr_subscribe_since_seconds() -> u64 {
        3_600
    }
    pub fn max_privacy_level() -> u8 {
        2
    }
    pub fn oracle_timeout_ms() -> u64 {
        5_000
    }
    pub fn retry_max_attempts() -> u32 {
        3
    }
    pub fn retry_base_delay_ms() -> u64 {
        250
    }
    pub fn retry_max_delay_ms() -> u64 {
        5_000
    }
    pub fn runner_kind() -> super::RunnerKind {
        super::RunnerKind::Mock
    }
    pub fn runner_timeout_ms() -> u64 {
        60_000
    }
    pub fn payment_request_retention_ms() -> i64 {
        60 * 60 * 1000
    }
    pub fn payment_receipt_retention_ms() -> i64 {
        24 * 60 * 60 * 1000
    }
    pub fn node_retention_ms() -> i64 {
        24 * 60 * 60 * 1000
    }
    pub fn node_health_retention_ms() -> i64 {
        24 * 60 * 60 * 1000
    }
    pub fn node_cooldown_retention_ms() -> i64 {
        60 * 60 * 1000
    }
    pub fn federation_job_retention_ms() -> i64 {
        60 * 60 * 1000
    }
    pub fn payment_reconcile_grace_ms() -> i64 {
        2 * 60 * 1000
    }
    pub fn router_rate_limit_max() -> u32 {
        120
    }
    pub fn forward_timeout_ms() -> u64 {
        30_000
    }
    pub fn capacity_max_concurrent() -> i64 {
        4
    }
    pub fn max_prompt_bytes() -> usize {
        64 * 1024
    }
    pub fn max_tokens() -> u64 {
        4_096
    }
    pub fn max_request_bytes() -> usize {
        1024 * 1024
    }
    pub fn node_rate_limit_max() -> u32 {
        300
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;

    #[test]
    fn minimal_router_config_parses_with_defaults() {
        let keys = Keys::generate();
        let raw = format!(r#"{{"secretKey": "{}"}}"#, keys.nsec());
        let config: RouterConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.port, 8080);
        assert!(!config.require_payment);
        assert_eq!(config.secret_key.npub(), keys.npub());
        assert!(!config.federation.enabled);
    }

    #[test]
    fn env_reference_resolves() {
        let keys = Keys::generate();
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("INFERMESH_TEST_SECRET", keys.nsec()) };
        let raw = r#"{"secretKey": "$INFERMESH_TEST_SECRET"}"#;
        let config: RouterConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.secret_key.npub(), keys.npub());
    }

    #[test]
    fn missing_env_reference_fails() {
        let raw = r#"{"secretKey": "$INFERMESH_TEST_MISSING_VAR"}"#;
        assert!(serde_json::from_str::<RouterConfig>(raw).is_err());
    }

    #[test]
    fn node_config_effective_id_defaults_to_npub() {
        let keys = Keys::generate();
        let raw = format!(r#"{{"secretKey": "{}"}}"#, keys.nsec());
        let config: NodeConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.effective_node_id(), keys.npub().to_string());
        assert_eq!(config.capacity_max_concurrent, 4);
        assert_eq!(config.runner.kind, RunnerKind::Mock);
    }
}
