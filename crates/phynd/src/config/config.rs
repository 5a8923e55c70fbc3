use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use phyn_client::ClientOptions;
use phyn_client::Credentials;
use phyn_client::RetryPolicy;
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use super::diagnostics::format_diagnostics;
use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::ValidationError;
use super::partial::PartialConfig;
use crate::coordinator::PollSettings;
use crate::entity::UnitSystem;
use crate::push::PushSettings;

/// Configuration could not be loaded or is invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Rendered diagnostics for every error found.
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug)]
pub struct Config {
    pub logging: LoggingConfig,
    pub phyn: PhynConfig,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub api: ApiConfig,
    pub push: PushConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"phyn_client" = "debug"`.
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Tracing filter for the configured levels.
    pub fn filter(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
        )
    }
}

/// Phyn account and endpoint settings.
#[derive(Clone)]
pub struct PhynConfig {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub api_key: String,
    pub base_url: String,
    pub auth_url: String,
    pub region: String,
    pub units: UnitSystem,
}

impl std::fmt::Debug for PhynConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhynConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("auth_url", &self.auth_url)
            .field("region", &self.region)
            .field("units", &self.units)
            .finish()
    }
}

impl PhynConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn client_options(&self, request_timeout: Duration, retry: RetryPolicy) -> ClientOptions {
        ClientOptions {
            base_url: self.base_url.clone(),
            auth_url: self.auth_url.clone(),
            client_id: self.client_id.clone(),
            api_key: self.api_key.clone(),
            request_timeout,
            retry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub stale_after_missed_polls: u32,
    pub firmware_every_polls: u64,
    pub discovery_every_polls: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 20,
            stale_after_missed_polls: 1,
            firmware_every_polls: 60,
            discovery_every_polls: 60,
        }
    }
}

impl PollingConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            stale_after_missed_polls: self.stale_after_missed_polls,
            firmware_every_polls: self.firmware_every_polls,
            discovery_every_polls: self.discovery_every_polls,
        }
    }
}

/// Backoff for rate-limited requests.
///
/// A backoff must fit inside one device's poll timeout.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1".to_string(),
            port: 8566,
        }
    }
}

/// Realtime updates between polls.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub enabled: bool,
    pub reconnect_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_secs: 30,
        }
    }
}

impl PushConfig {
    /// Listener settings. The device set is rechecked once per poll
    /// interval.
    pub fn settings(&self, polling: &PollingConfig) -> PushSettings {
        PushSettings {
            reconnect_delay: Duration::from_secs(self.reconnect_secs),
            resubscribe_check: Duration::from_secs(polling.interval_secs),
        }
    }
}

/// Collects validation errors while converting partial values.
struct Validator<'a> {
    partial: &'a PartialConfig,
    errors: Vec<ValidationError>,
}

impl Validator<'_> {
    fn missing(&mut self, field_path: &str) {
        self.errors.push(ValidationError {
            field_path: field_path.to_string(),
            message: format!("{} is required", field_path),
            location: None,
        });
    }

    fn invalid(&mut self, field_path: &str, message: &str) {
        self.errors.push(ValidationError {
            field_path: field_path.to_string(),
            message: message.to_string(),
            location: self.partial.origins.get(field_path).cloned(),
        });
    }

    fn required(&mut self, field_path: &str, value: Option<&toml::Spanned<String>>) -> String {
        match value.map(|v| v.get_ref().trim()) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                self.missing(field_path);
                String::new()
            }
        }
    }

    fn positive(&mut self, field_path: &str, value: u64) -> u64 {
        if value == 0 {
            self.invalid(field_path, "must be greater than zero");
        }
        value
    }
}

fn value<T: Clone>(field: &Option<toml::Spanned<T>>) -> Option<T> {
    field.as_ref().map(|s| s.get_ref().clone())
}

impl Config {
    /// Load configuration from one or more TOML files.
    ///
    /// Files are merged with imports resolved; a field set in two places is
    /// an error. Returns the config with any warnings, or every error found
    /// rendered for display.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Validate a merged config, adding to the merge diagnostics.
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut v = Validator {
            partial: &partial,
            errors: Vec::new(),
        };

        let logging = partial
            .logging
            .as_ref()
            .map(|l| LoggingConfig {
                level: value(&l.level).unwrap_or_default(),
                overrides: l
                    .overrides
                    .as_ref()
                    .map(|o| o.iter().map(|(k, s)| (k.clone(), *s.get_ref())).collect())
                    .unwrap_or_default(),
            })
            .unwrap_or_default();

        let p = partial.phyn.clone().unwrap_or_default();
        let region = value(&p.region).unwrap_or_else(|| ClientOptions::DEFAULT_REGION.to_string());
        let phyn = PhynConfig {
            username: v.required("phyn.username", p.username.as_ref()),
            password: v.required("phyn.password", p.password.as_ref()),
            client_id: v.required("phyn.client_id", p.client_id.as_ref()),
            api_key: v.required("phyn.api_key", p.api_key.as_ref()),
            base_url: value(&p.base_url).unwrap_or_else(|| ClientOptions::DEFAULT_BASE_URL.to_string()),
            auth_url: value(&p.auth_url).unwrap_or_else(|| ClientOptions::cognito_url(&region)),
            region,
            units: value(&p.units).unwrap_or_default(),
        };

        let defaults = PollingConfig::default();
        let pp = partial.polling.clone().unwrap_or_default();
        let polling = PollingConfig {
            interval_secs: v.positive(
                "polling.interval_secs",
                value(&pp.interval_secs).unwrap_or(defaults.interval_secs),
            ),
            timeout_secs: v.positive(
                "polling.timeout_secs",
                value(&pp.timeout_secs).unwrap_or(defaults.timeout_secs),
            ),
            stale_after_missed_polls: value(&pp.stale_after_missed_polls)
                .unwrap_or(defaults.stale_after_missed_polls),
            firmware_every_polls: value(&pp.firmware_every_polls).unwrap_or(defaults.firmware_every_polls),
            discovery_every_polls: value(&pp.discovery_every_polls)
                .unwrap_or(defaults.discovery_every_polls),
        };

        let defaults = RetryConfig::default();
        let pr = partial.retry.clone().unwrap_or_default();
        let retry = RetryConfig {
            max_retries: value(&pr.max_retries).unwrap_or(defaults.max_retries),
            initial_backoff_ms: value(&pr.initial_backoff_ms).unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: value(&pr.max_backoff_ms).unwrap_or(defaults.max_backoff_ms),
        };
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            v.invalid(
                "retry.max_backoff_ms",
                "must not be smaller than retry.initial_backoff_ms",
            );
        }
        if retry.max_retries > 0 && retry.max_backoff_ms >= polling.timeout_secs.saturating_mul(1000) {
            v.invalid(
                "retry.max_backoff_ms",
                "must be shorter than polling.timeout_secs",
            );
        }

        let defaults = ApiConfig::default();
        let pa = partial.api.clone().unwrap_or_default();
        let api = ApiConfig {
            enabled: value(&pa.enabled).unwrap_or(defaults.enabled),
            listen: value(&pa.listen).unwrap_or(defaults.listen),
            port: value(&pa.port).unwrap_or(defaults.port),
        };

        let defaults = PushConfig::default();
        let pu = partial.push.clone().unwrap_or_default();
        let push = PushConfig {
            enabled: value(&pu.enabled).unwrap_or(defaults.enabled),
            reconnect_secs: v.positive(
                "push.reconnect_secs",
                value(&pu.reconnect_secs).unwrap_or(defaults.reconnect_secs),
            ),
        };

        diagnostics.extend(
            v.errors
                .into_iter()
                .map(|e| Diagnostic::Error(Error::Validation(e))),
        );

        if diagnostics.iter().any(|d| d.is_error()) {
            return Err(ConfigError::Invalid(format_diagnostics(&diagnostics)));
        }

        Ok((
            Config {
                logging,
                phyn,
                polling,
                retry,
                api,
                push,
            },
            diagnostics,
        ))
    }
}
