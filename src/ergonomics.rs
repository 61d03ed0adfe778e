//! Gating helpers built on top of the client facades.
//!
//! - [`feature_flag()`] wraps a function so that it only runs while a flag is on.
//! - [`experiment_variant()`] wraps a function so that it receives the caller's assigned variant.
//! - [`FeatureToggle`] and [`ExperimentContext`] capture a single evaluation for a block of code.
//!
//! Every helper is fail-open: evaluation failures fall back to the supplied defaults.
//!
//! # Examples
//!
//! ```no_run
//! # use feature_flags::{feature_flag, ClientConfig, ClientCore};
//! # fn main() -> feature_flags::Result<()> {
//! let client = ClientCore::new(ClientConfig::new("http://localhost:8080"))?.sync_client();
//!
//! let greet = feature_flag(client, "new-greeting", false, String::from("Hello"))
//!     .wrap(|name: &str| format!("Howdy, {name}"));
//!
//! // Prints "Hello" unless `new-greeting` is on.
//! println!("{}", greet.call("Ferris"));
//! # Ok(())
//! # }
//! ```
use std::{future::Future, ops::Deref};

use crate::{AsyncClient, EvaluationResult, ExperimentResult, SyncClient, Variant};

/// A flag gate, waiting for the function it guards. Created by [`feature_flag()`].
#[derive(Debug, Clone)]
pub struct FlagGate<C, R> {
    client: C,
    key: String,
    default: bool,
    default_return: R,
}

/// Gate a function behind flag `key`.
///
/// The returned gate is completed with [`FlagGate::wrap()`]. When the flag is off (or cannot be
/// evaluated and `default` is `false`), the wrapped function is not run and `default_return` is
/// returned instead.
///
/// Works with both [`SyncClient`] and [`AsyncClient`]; with the latter, `call()` is async.
pub fn feature_flag<C, R>(
    client: C,
    key: impl Into<String>,
    default: bool,
    default_return: R,
) -> FlagGate<C, R> {
    FlagGate {
        client,
        key: key.into(),
        default,
        default_return,
    }
}

impl<C, R> FlagGate<C, R> {
    /// Gate `f` behind the flag.
    pub fn wrap<F>(self, f: F) -> FeatureFlagged<C, R, F> {
        FeatureFlagged { gate: self, f }
    }
}

/// A function gated behind a flag. Created by [`FlagGate::wrap()`].
#[derive(Debug, Clone)]
pub struct FeatureFlagged<C, R, F> {
    gate: FlagGate<C, R>,
    f: F,
}

impl<C, R, F> FeatureFlagged<C, R, F> {
    /// Key of the gating flag or experiment.
    pub fn key(&self) -> &str {
        &self.gate.key
    }
}

impl<R: Clone, F> FeatureFlagged<SyncClient, R, F> {
    /// Run the wrapped function if the flag is on; return the default value otherwise.
    pub fn call<A>(&self, args: A) -> R
    where
        F: Fn(A) -> R,
    {
        let gate = &self.gate;
        if gate.client.is_enabled(&gate.key, gate.default) {
            (self.f)(args)
        } else {
            log::trace!(target: "feature_flags",
                        key = gate.key.as_str();
                        "flag is off, skipping gated call");
            gate.default_return.clone()
        }
    }
}

impl<R: Clone, F> FeatureFlagged<AsyncClient, R, F> {
    /// Run the wrapped function if the flag is on; return the default value otherwise.
    pub async fn call<A, Fut>(&self, args: A) -> R
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = R>,
    {
        let gate = &self.gate;
        if gate.client.is_enabled(&gate.key, gate.default).await {
            (self.f)(args).await
        } else {
            log::trace!(target: "feature_flags",
                        key = gate.key.as_str();
                        "flag is off, skipping gated call");
            gate.default_return.clone()
        }
    }
}

/// An experiment, waiting for the function that takes its variant. Created by
/// [`experiment_variant()`].
#[derive(Debug, Clone)]
pub struct VariantGate<C> {
    client: C,
    key: String,
    default_variant: Variant,
}

/// Inject the variant of experiment `key` into a function.
///
/// The returned gate is completed with [`VariantGate::wrap()`], which takes a function returning
/// the subject id for the call arguments and the function to run. The function receives the
/// arguments and the assigned variant, or `default_variant` if the experiment cannot be evaluated.
pub fn experiment_variant<C>(
    client: C,
    key: impl Into<String>,
    default_variant: Variant,
) -> VariantGate<C> {
    VariantGate {
        client,
        key: key.into(),
        default_variant,
    }
}

impl<C> VariantGate<C> {
    /// Inject the variant of the subject `subject_of` extracts from the call arguments into `f`.
    pub fn wrap<S, F>(self, subject_of: S, f: F) -> VariantInjected<C, S, F> {
        VariantInjected {
            gate: self,
            subject_of,
            f,
        }
    }
}

/// A function receiving an experiment variant. Created by [`VariantGate::wrap()`].
#[derive(Debug, Clone)]
pub struct VariantInjected<C, S, F> {
    gate: VariantGate<C>,
    subject_of: S,
    f: F,
}

impl<C, S, F> VariantInjected<C, S, F> {
    /// Key of the gating flag or experiment.
    pub fn key(&self) -> &str {
        &self.gate.key
    }
}

impl<S, F> VariantInjected<SyncClient, S, F> {
    /// Assign the subject of `args` and run the wrapped function with its variant.
    pub fn call<A, I, R>(&self, args: A) -> R
    where
        S: Fn(&A) -> I,
        I: AsRef<str>,
        F: Fn(A, Variant) -> R,
    {
        let gate = &self.gate;
        let subject_id = (self.subject_of)(&args);
        let variant = gate.client.get_variant(
            &gate.key,
            subject_id.as_ref(),
            gate.default_variant.clone(),
        );
        (self.f)(args, variant)
    }
}

impl<S, F> VariantInjected<AsyncClient, S, F> {
    /// Assign the subject of `args` and run the wrapped function with its variant.
    pub async fn call<A, I, R, Fut>(&self, args: A) -> R
    where
        S: Fn(&A) -> I,
        I: AsRef<str>,
        F: Fn(A, Variant) -> Fut,
        Fut: Future<Output = R>,
    {
        let gate = &self.gate;
        let subject_id = (self.subject_of)(&args).as_ref().to_owned();
        let variant = gate
            .client
            .get_variant(&gate.key, &subject_id, gate.default_variant.clone())
            .await;
        (self.f)(args, variant).await
    }
}

/// A flag evaluated once. Dereferences to the captured [`EvaluationResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureToggle {
    key: String,
    result: EvaluationResult,
}

impl FeatureToggle {
    pub(crate) fn new(key: &str, result: EvaluationResult) -> FeatureToggle {
        FeatureToggle {
            key: key.to_owned(),
            result,
        }
    }

    /// Flag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the flag was on when captured.
    pub fn is_enabled(&self) -> bool {
        self.result.enabled
    }

    /// Take the captured result.
    pub fn into_result(self) -> EvaluationResult {
        self.result
    }
}

impl Deref for FeatureToggle {
    type Target = EvaluationResult;

    fn deref(&self) -> &EvaluationResult {
        &self.result
    }
}

/// An experiment assignment captured for one subject. Dereferences to the captured
/// [`ExperimentResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentContext {
    key: String,
    subject_id: String,
    result: ExperimentResult,
}

impl ExperimentContext {
    pub(crate) fn new(key: &str, subject_id: &str, result: ExperimentResult) -> ExperimentContext {
        ExperimentContext {
            key: key.to_owned(),
            subject_id: subject_id.to_owned(),
            result,
        }
    }

    /// Experiment key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Subject the assignment was made for.
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Take the captured result.
    pub fn into_result(self) -> ExperimentResult {
        self.result
    }
}

impl Deref for ExperimentContext {
    type Target = ExperimentResult;

    fn deref(&self) -> &ExperimentResult {
        &self.result
    }
}
