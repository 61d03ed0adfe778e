use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    definitions::{ExperimentDefinition, FlagDefinition},
    ergonomics::{ExperimentContext, FeatureToggle},
    policy::ErrorPolicy,
    sharder::Md5Sharder,
    ClientCore, EvaluationResult, ExperimentResult, Result, Variant,
};

/// Async facade of the feature flag client.
///
/// Mirrors [`SyncClient`](crate::SyncClient) operation for operation. Evaluations suspend the
/// calling task instead of blocking the thread, and must be awaited inside a tokio runtime.
///
/// The facade shares caches with every other facade of the same [`ClientCore`], so a fetch in
/// flight is joined regardless of which facade started it. A caller that stops waiting (timeout
/// or cancellation) does not cancel the fetch for others.
///
/// # Examples
///
/// ```no_run
/// # use feature_flags::{ClientConfig, ClientCore};
/// # async fn handle_request() -> feature_flags::Result<()> {
/// let client = ClientCore::new(ClientConfig::new("http://localhost:8080"))?.async_client();
///
/// let feature = client.get_feature("rate-limit", true).await;
/// let limit = feature.config_i64("limit").unwrap_or(100);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncClient {
    core: Arc<ClientCore>,
    timeout: Duration,
}

impl AsyncClient {
    /// Create an async facade over `core`, waiting at most
    /// [`ClientConfig::evaluation_timeout`](crate::ClientConfig::evaluation_timeout) per call.
    pub fn new(core: Arc<ClientCore>) -> AsyncClient {
        let timeout = core.config().evaluation_timeout;
        AsyncClient { core, timeout }
    }

    /// Return a handle sharing this client's core but waiting at most `timeout` per call.
    pub fn with_timeout(&self, timeout: Duration) -> AsyncClient {
        AsyncClient {
            core: self.core.clone(),
            timeout,
        }
    }

    /// The core this facade evaluates against.
    pub fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    /// Evaluate flag `key`, optionally for `subject_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only when `default` is `None`. See
    /// [`SyncClient::evaluate_flag()`](crate::SyncClient::evaluate_flag).
    pub async fn evaluate_flag(
        &self,
        key: &str,
        subject_id: Option<&str>,
        default: Option<bool>,
    ) -> Result<EvaluationResult> {
        let outcome = self
            .core
            .get::<FlagDefinition>(key, subject_id, self.timeout)
            .await
            .map(|flag| {
                let result = flag.eval(subject_id);
                log::trace!(target: "feature_flags",
                            key,
                            subject_id,
                            result:serde = result;
                            "evaluated a flag");
                result
            });
        ErrorPolicy::from(default.map(EvaluationResult::from_default)).resolve(key, outcome)
    }

    /// Returns whether flag `key` is on, or `default` if it cannot be evaluated.
    pub async fn is_enabled(&self, key: &str, default: bool) -> bool {
        self.is_enabled_for(key, None, default).await
    }

    /// Returns whether flag `key` is on for `subject_id`, or `default` if it cannot be evaluated.
    pub async fn is_enabled_for(
        &self,
        key: &str,
        subject_id: Option<&str>,
        default: bool,
    ) -> bool {
        self.evaluate_flag(key, subject_id, Some(default))
            .await
            .map_or(default, |result| result.enabled)
    }

    /// Returns whether flag `key` is on, failing if it cannot be evaluated.
    pub async fn check_flag(&self, key: &str) -> Result<bool> {
        self.evaluate_flag(key, None, None)
            .await
            .map(|result| result.enabled)
    }

    /// Evaluate flag `key`, falling back to a default result with no config.
    pub async fn get_feature(&self, key: &str, default_enabled: bool) -> EvaluationResult {
        self.evaluate_flag(key, None, Some(default_enabled))
            .await
            .unwrap_or_else(|_| EvaluationResult::from_default(default_enabled))
    }

    /// Assign `subject_id` to a variant of experiment `key`.
    ///
    /// # Errors
    ///
    /// Returns an error only when `default_variant` is `None`. See
    /// [`SyncClient::evaluate_experiment()`](crate::SyncClient::evaluate_experiment).
    pub async fn evaluate_experiment(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Option<Variant>,
    ) -> Result<ExperimentResult> {
        let outcome = self
            .core
            .get::<ExperimentDefinition>(key, Some(subject_id), self.timeout)
            .await
            .map(|experiment| {
                let result = experiment.eval(subject_id, &Md5Sharder);
                log::trace!(target: "feature_flags",
                            key,
                            subject_id,
                            variant:display = result.variant;
                            "assigned a variant");
                result
            });
        ErrorPolicy::from(default_variant.map(ExperimentResult::from_default)).resolve(key, outcome)
    }

    /// Assign `subject_id` in experiment `key`, falling back to `default_variant` with no payload.
    pub async fn get_experiment(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
    ) -> ExperimentResult {
        self.evaluate_experiment(key, subject_id, Some(default_variant.clone()))
            .await
            .unwrap_or_else(|_| ExperimentResult::from_default(default_variant))
    }

    /// The variant `subject_id` is assigned to in experiment `key`, or `default_variant`.
    pub async fn get_variant(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
    ) -> Variant {
        self.get_experiment(key, subject_id, default_variant)
            .await
            .variant
    }

    /// Evaluate flag `key` once and capture the result.
    pub async fn feature_toggle(&self, key: &str, default: bool) -> FeatureToggle {
        FeatureToggle::new(key, self.get_feature(key, default).await)
    }

    /// Evaluate experiment `key` for `subject_id` once and capture the result.
    pub async fn experiment_context(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
    ) -> ExperimentContext {
        let result = self.get_experiment(key, subject_id, default_variant).await;
        ExperimentContext::new(key, subject_id, result)
    }

    /// Run `body` with the captured state of flag `key`.
    pub async fn with_feature_toggle<T, Fut>(
        &self,
        key: &str,
        default: bool,
        body: impl FnOnce(FeatureToggle) -> Fut,
    ) -> T
    where
        Fut: Future<Output = T>,
    {
        body(self.feature_toggle(key, default).await).await
    }

    /// Run `body` with the captured assignment of `subject_id` in experiment `key`.
    pub async fn with_experiment<T, Fut>(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
        body: impl FnOnce(ExperimentContext) -> Fut,
    ) -> T
    where
        Fut: Future<Output = T>,
    {
        body(self.experiment_context(key, subject_id, default_variant).await).await
    }
}
