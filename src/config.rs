use std::{str::FromStr, time::Duration};

use crate::{Error, Result};

/// Configuration for the feature flag client.
///
/// The configuration is read once by [`initialize()`](crate::initialize) (or
/// [`ClientCore::new()`](crate::ClientCore::new)) and is read-only afterwards.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use feature_flags::ClientConfig;
/// let config = ClientConfig::new("http://localhost:8080")
///     .with_environment("staging")
///     .with_cache_ttl(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the flag service, e.g., `http://localhost:8080`.
    pub base_url: String,
    /// Environment name sent with every request.
    pub environment: Option<String>,
    /// Timeout of a single HTTP request.
    ///
    /// Defaults to [`ClientConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
    /// How long a fetched definition is served without refetching.
    ///
    /// Defaults to [`ClientConfig::DEFAULT_CACHE_TTL`].
    pub cache_ttl: Duration,
    /// Number of additional attempts after a network failure or timeout.
    ///
    /// Defaults to [`ClientConfig::DEFAULT_RETRY_COUNT`].
    pub retry_count: u32,
    /// Longest time a single evaluation call waits for the flag service before falling back. Can
    /// be overridden per handle with `with_timeout()`.
    ///
    /// Defaults to [`ClientConfig::DEFAULT_EVALUATION_TIMEOUT`].
    pub evaluation_timeout: Duration,
}

impl ClientConfig {
    /// Default value for [`ClientConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default value for [`ClientConfig::cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
    /// Default value for [`ClientConfig::retry_count`].
    pub const DEFAULT_RETRY_COUNT: u32 = 2;
    /// Default value for [`ClientConfig::evaluation_timeout`].
    pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Environment variable holding the base URL.
    pub const BASE_URL_VAR: &'static str = "FEATURE_FLAG_BASE_URL";
    /// Environment variable holding the environment name.
    pub const ENVIRONMENT_VAR: &'static str = "FEATURE_FLAG_ENVIRONMENT";
    /// Environment variable holding the request timeout in milliseconds.
    pub const TIMEOUT_MS_VAR: &'static str = "FEATURE_FLAG_TIMEOUT_MS";
    /// Environment variable holding the cache TTL in seconds.
    pub const CACHE_TTL_SECS_VAR: &'static str = "FEATURE_FLAG_CACHE_TTL_SECS";
    /// Environment variable holding the retry count.
    pub const RETRY_COUNT_VAR: &'static str = "FEATURE_FLAG_RETRY_COUNT";

    /// Create a configuration with default settings for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> ClientConfig {
        ClientConfig {
            base_url: base_url.into(),
            environment: None,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            cache_ttl: ClientConfig::DEFAULT_CACHE_TTL,
            retry_count: ClientConfig::DEFAULT_RETRY_COUNT,
            evaluation_timeout: ClientConfig::DEFAULT_EVALUATION_TIMEOUT,
        }
    }

    /// Read configuration from `FEATURE_FLAG_*` environment variables.
    ///
    /// `FEATURE_FLAG_BASE_URL` is required; other variables fall back to defaults when unset.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the base URL is missing or a variable cannot be parsed.
    pub fn from_env() -> Result<ClientConfig> {
        ClientConfig::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ClientConfig> {
        let base_url = lookup(Self::BASE_URL_VAR).ok_or_else(|| {
            Error::InvalidConfig(format!("{} is not set", Self::BASE_URL_VAR))
        })?;

        let mut config = ClientConfig::new(base_url);
        config.environment = lookup(Self::ENVIRONMENT_VAR).filter(|env| !env.is_empty());
        if let Some(ms) = parse_var::<u64>(&lookup, Self::TIMEOUT_MS_VAR)? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, Self::CACHE_TTL_SECS_VAR)? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, Self::RETRY_COUNT_VAR)? {
            config.retry_count = retries;
        }
        Ok(config)
    }

    /// Set environment name sent to the flag service.
    pub fn with_environment(mut self, environment: impl Into<String>) -> ClientConfig {
        self.environment = Some(environment.into());
        self
    }

    /// Set timeout for a single HTTP request to the flag service.
    pub fn with_request_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.request_timeout = timeout;
        self
    }

    /// Set how long a fetched definition is served before it is refreshed.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> ClientConfig {
        self.cache_ttl = ttl;
        self
    }

    /// Set number of retries after a failed fetch attempt.
    pub fn with_retry_count(mut self, retry_count: u32) -> ClientConfig {
        self.retry_count = retry_count;
        self
    }

    /// Set how long an evaluation waits for a fetch before giving up.
    pub fn with_evaluation_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.evaluation_timeout = timeout;
        self
    }

    /// Validate the configuration and return the parsed base URL.
    pub(crate) fn parsed_base_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.base_url).map_err(Error::InvalidBaseUrl)?;
        if url.cannot_be_a_base() {
            return Err(Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        // Path segments are appended to the base, so drop a trailing empty segment.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
        }
        Ok(url)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{name}={value:?} is not a valid number"))),
    }
}
