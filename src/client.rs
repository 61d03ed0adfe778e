use std::{sync::Arc, time::Duration};

use crate::{
    definitions::{ExperimentDefinition, FlagDefinition},
    ergonomics::{ExperimentContext, FeatureToggle},
    policy::ErrorPolicy,
    sharder::Md5Sharder,
    ClientCore, EvaluationResult, ExperimentResult, Result, Variant,
};

/// Blocking facade of the feature flag client.
///
/// Evaluation calls block the current thread while a definition is fetched; cached definitions are
/// served without blocking. Do not call from inside an async task; use
/// [`AsyncClient`](crate::AsyncClient) there instead.
///
/// Every operation comes in two flavors. Calls taking a default never fail: any failure is logged
/// and the default is returned (fail-open). Calls without a default return the failure as
/// [`Error`](crate::Error) (fail-closed).
///
/// # Examples
///
/// ```no_run
/// # use feature_flags::{ClientConfig, ClientCore, Variant};
/// # fn main() -> feature_flags::Result<()> {
/// let client = ClientCore::new(ClientConfig::new("http://localhost:8080"))?.sync_client();
///
/// if client.is_enabled("new-ui", false) {
///     // render new UI
/// }
///
/// let variant = client.get_variant("checkout-flow", "user-123", Variant::Control);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SyncClient {
    core: Arc<ClientCore>,
    timeout: Duration,
}

impl SyncClient {
    /// Create a blocking facade over `core`, waiting at most
    /// [`ClientConfig::evaluation_timeout`](crate::ClientConfig::evaluation_timeout) per call.
    pub fn new(core: Arc<ClientCore>) -> SyncClient {
        let timeout = core.config().evaluation_timeout;
        SyncClient { core, timeout }
    }

    /// Return a handle sharing this client's core but waiting at most `timeout` per call.
    pub fn with_timeout(&self, timeout: Duration) -> SyncClient {
        SyncClient {
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
    /// Returns an error only when `default` is `None`:
    /// - [`Error::Evaluation`](crate::Error::Evaluation) if the flag could not be fetched.
    /// - [`Error::Closed`](crate::Error::Closed) if the client was cleaned up.
    pub fn evaluate_flag(
        &self,
        key: &str,
        subject_id: Option<&str>,
        default: Option<bool>,
    ) -> Result<EvaluationResult> {
        let outcome = self
            .core
            .get_blocking::<FlagDefinition>(key, subject_id, self.timeout)
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
    pub fn is_enabled(&self, key: &str, default: bool) -> bool {
        self.is_enabled_for(key, None, default)
    }

    /// Returns whether flag `key` is on for `subject_id`, or `default` if it cannot be evaluated.
    pub fn is_enabled_for(&self, key: &str, subject_id: Option<&str>, default: bool) -> bool {
        self.evaluate_flag(key, subject_id, Some(default))
            .map_or(default, |result| result.enabled)
    }

    /// Returns whether flag `key` is on, failing if it cannot be evaluated.
    pub fn check_flag(&self, key: &str) -> Result<bool> {
        self.evaluate_flag(key, None, None).map(|result| result.enabled)
    }

    /// Evaluate flag `key` including its config. Returns a result with `default_enabled` and no
    /// config if the flag cannot be evaluated.
    pub fn get_feature(&self, key: &str, default_enabled: bool) -> EvaluationResult {
        self.evaluate_flag(key, None, Some(default_enabled))
            .unwrap_or_else(|_| EvaluationResult::from_default(default_enabled))
    }

    /// Assign `subject_id` to a variant of experiment `key`.
    ///
    /// The assignment is deterministic: the same subject always lands in the same variant for a
    /// given traffic split.
    ///
    /// # Errors
    ///
    /// Returns an error only when `default_variant` is `None`:
    /// - [`Error::Evaluation`](crate::Error::Evaluation) if the experiment could not be fetched.
    /// - [`Error::Closed`](crate::Error::Closed) if the client was cleaned up.
    pub fn evaluate_experiment(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Option<Variant>,
    ) -> Result<ExperimentResult> {
        let outcome = self
            .core
            .get_blocking::<ExperimentDefinition>(key, Some(subject_id), self.timeout)
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

    /// Assign `subject_id` to a variant of experiment `key`, returning `default_variant` without a
    /// payload if the experiment cannot be evaluated.
    pub fn get_experiment(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
    ) -> ExperimentResult {
        self.evaluate_experiment(key, subject_id, Some(default_variant.clone()))
            .unwrap_or_else(|_| ExperimentResult::from_default(default_variant))
    }

    /// Like [`SyncClient::get_experiment()`] but returns the variant only.
    pub fn get_variant(&self, key: &str, subject_id: &str, default_variant: Variant) -> Variant {
        self.get_experiment(key, subject_id, default_variant).variant
    }

    /// Evaluate flag `key` once and capture the result.
    pub fn feature_toggle(&self, key: &str, default: bool) -> FeatureToggle {
        FeatureToggle::new(key, self.get_feature(key, default))
    }

    /// Evaluate experiment `key` for `subject_id` once and capture the result.
    pub fn experiment_context(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
    ) -> ExperimentContext {
        let result = self.get_experiment(key, subject_id, default_variant);
        ExperimentContext::new(key, subject_id, result)
    }

    /// Run `body` with the captured state of flag `key`.
    pub fn with_feature_toggle<T>(
        &self,
        key: &str,
        default: bool,
        body: impl FnOnce(&FeatureToggle) -> T,
    ) -> T {
        body(&self.feature_toggle(key, default))
    }

    /// Run `body` with the captured assignment of `subject_id` in experiment `key`.
    pub fn with_experiment<T>(
        &self,
        key: &str,
        subject_id: &str,
        default_variant: Variant,
        body: impl FnOnce(&ExperimentContext) -> T,
    ) -> T {
        body(&self.experiment_context(key, subject_id, default_variant))
    }
}
