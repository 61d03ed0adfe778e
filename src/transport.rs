//! HTTP client that fetches flag and experiment definitions from the flag service.
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::{StatusCode, Url};

use crate::{
    definitions::{ExperimentDefinition, ExperimentResponse, FlagDefinition},
    error::FetchError,
    ClientConfig, Result,
};

/// A single request/response exchange with the flag service.
///
/// The client calls a transport only on cache misses. Implementations classify every failure
/// into a [`FetchError`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the definition of flag `key`. `subject_id` is the subject whose evaluation triggered
    /// the fetch, if any.
    async fn fetch_flag(
        &self,
        key: &str,
        subject_id: Option<&str>,
    ) -> std::result::Result<FlagDefinition, FetchError>;

    /// Fetch the definition of experiment `key`, on behalf of `subject_id`.
    async fn fetch_experiment(
        &self,
        key: &str,
        subject_id: Option<&str>,
    ) -> std::result::Result<ExperimentDefinition, FetchError>;
}

const FLAGS_ENDPOINT: &str = "flags";
const EXPERIMENTS_ENDPOINT: &str = "experiments";

/// [`Transport`] talking JSON over HTTP.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: Url,
    environment: Option<String>,
}

impl HttpTransport {
    /// Create a transport for the service configured in `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the base URL cannot be parsed.
    pub fn new(config: &ClientConfig) -> Result<HttpTransport> {
        let base_url = config.parsed_base_url()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("feature-flags-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| crate::Error::InvalidConfig(err.to_string()))?;

        Ok(HttpTransport {
            client,
            base_url,
            environment: config.environment.clone(),
        })
    }

    fn url(&self, endpoint: &str, key: &str, subject_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(endpoint).push(key);
        }
        if subject_id.is_some() || self.environment.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(subject_id) = subject_id {
                query.append_pair("subject_id", subject_id);
            }
            if let Some(environment) = &self.environment {
                query.append_pair("environment", environment);
            }
        }
        url
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        key: &str,
        subject_id: Option<&str>,
    ) -> std::result::Result<T, FetchError> {
        let url = self.url(endpoint, key, subject_id);

        log::debug!(target: "feature_flags", endpoint, key; "fetching definition");
        let response = self.client.get(url).send().await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                log::debug!(target: "feature_flags",
                            endpoint,
                            key;
                            "key is unknown to the flag service");
                return Err(FetchError::UnknownKey);
            }
            status => {
                log::warn!(target: "feature_flags",
                           endpoint,
                           key,
                           status = status.as_u16();
                           "received non-success response while fetching definition");
                return Err(FetchError::BadResponse(format!("unexpected status {status}")));
            }
        }

        let body = response.bytes().await?;
        let definition = serde_json::from_slice(&body).map_err(|err| {
            log::warn!(target: "feature_flags",
                       endpoint,
                       key,
                       error:display = err;
                       "failed to parse definition");
            FetchError::BadResponse(err.to_string())
        })?;

        log::debug!(target: "feature_flags", endpoint, key; "successfully fetched definition");
        Ok(definition)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_flag(
        &self,
        key: &str,
        subject_id: Option<&str>,
    ) -> std::result::Result<FlagDefinition, FetchError> {
        let mut flag: FlagDefinition = self.get(FLAGS_ENDPOINT, key, subject_id).await?;
        flag.key = key.to_owned();
        Ok(flag)
    }

    async fn fetch_experiment(
        &self,
        key: &str,
        subject_id: Option<&str>,
    ) -> std::result::Result<ExperimentDefinition, FetchError> {
        let response: ExperimentResponse =
            self.get(EXPERIMENTS_ENDPOINT, key, subject_id).await?;
        response.into_definition(key)
    }
}

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_JITTER: Duration = Duration::from_millis(50);

/// Run `attempt` up to `1 + retry_count` times, retrying only transient failures.
pub(crate) async fn with_retries<T, F, Fut>(
    key: &str,
    retry_count: u32,
    mut attempt: F,
) -> std::result::Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, FetchError>>,
{
    let mut retries_left = retry_count;
    let mut backoff = RETRY_BACKOFF;
    loop {
        match attempt().await {
            Err(err) if err.is_transient() && retries_left > 0 => {
                log::debug!(target: "feature_flags",
                            key,
                            retries_left,
                            error:display = err;
                            "transient failure, retrying");
                retries_left -= 1;
                tokio::time::sleep(jitter(backoff, RETRY_JITTER)).await;
                backoff = backoff.saturating_mul(2);
            }
            result => return result,
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    interval.saturating_add(thread_rng().gen_range(Duration::ZERO..=jitter))
}
