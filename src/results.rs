use std::fmt;

use serde::{Deserialize, Serialize};

/// String-keyed JSON object used for flag configs and experiment payloads.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// An experiment arm.
///
/// `control` and `treatment` are the well-known arms; any other name is kept verbatim in
/// [`Variant::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Variant {
    /// The baseline arm.
    Control,
    /// The arm receiving the change under test.
    Treatment,
    /// Any additional named arm. `"control"` and `"treatment"` stored here are treated as
    /// [`Variant::Control`] and [`Variant::Treatment`] by [`ExperimentDefinition`].
    ///
    /// [`ExperimentDefinition`]: crate::ExperimentDefinition
    Other(String),
}

impl Variant {
    /// The variant name as sent by the flag service.
    pub fn as_str(&self) -> &str {
        match self {
            Variant::Control => "control",
            Variant::Treatment => "treatment",
            Variant::Other(name) => name,
        }
    }

    /// Map reserved names held in [`Variant::Other`] to their well-known variant.
    pub(crate) fn canonical(self) -> Variant {
        match self {
            Variant::Other(name) => Variant::from(name),
            known => known,
        }
    }

    /// Returns `true` for [`Variant::Control`].
    pub fn is_control(&self) -> bool {
        *self == Variant::Control
    }

    /// Returns `true` for [`Variant::Treatment`].
    pub fn is_treatment(&self) -> bool {
        *self == Variant::Treatment
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        match value {
            "control" => Variant::Control,
            "treatment" => Variant::Treatment,
            other => Variant::Other(other.to_owned()),
        }
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        match value.as_str() {
            "control" => Variant::Control,
            "treatment" => Variant::Treatment,
            _ => Variant::Other(value),
        }
    }
}

impl From<Variant> for String {
    fn from(value: Variant) -> Self {
        match value {
            Variant::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a flag evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Whether the feature is on.
    pub enabled: bool,
    /// Configuration attached to the flag, if any.
    pub config: Option<ConfigMap>,
}

impl EvaluationResult {
    /// A result with no configuration. Used when substituting a caller default.
    pub fn from_default(enabled: bool) -> EvaluationResult {
        EvaluationResult {
            enabled,
            config: None,
        }
    }

    /// Returns the config value under `name`, or `None` if there is no config or no such entry.
    pub fn config_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.config.as_ref()?.get(name)
    }

    /// Config value under `name` as a number.
    pub fn config_f64(&self, name: &str) -> Option<f64> {
        self.config_value(name)?.as_f64()
    }

    /// Config value under `name` as an integer.
    pub fn config_i64(&self, name: &str) -> Option<i64> {
        self.config_value(name)?.as_i64()
    }

    /// Config value under `name` as a boolean.
    pub fn config_bool(&self, name: &str) -> Option<bool> {
        self.config_value(name)?.as_bool()
    }

    /// Config value under `name` as a string.
    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config_value(name)?.as_str()
    }
}

/// Outcome of an experiment evaluation for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// The arm the subject was assigned to.
    pub variant: Variant,
    /// Payload configured for that arm, if any.
    pub payload: Option<ConfigMap>,
}

impl ExperimentResult {
    /// A result with no payload. Used when substituting a caller default.
    pub fn from_default(variant: Variant) -> ExperimentResult {
        ExperimentResult {
            variant,
            payload: None,
        }
    }

    /// Returns the payload value under `name`, or `None` if there is no payload or no such entry.
    ///
    /// ```
    /// # use feature_flags::{ExperimentResult, Variant};
    /// let result = ExperimentResult::from_default(Variant::Control);
    /// let discount = result.payload_f64("discount").unwrap_or(0.1);
    /// assert_eq!(discount, 0.1);
    /// ```
    pub fn payload_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.as_ref()?.get(name)
    }

    /// Payload value under `name` as a number.
    pub fn payload_f64(&self, name: &str) -> Option<f64> {
        self.payload_value(name)?.as_f64()
    }

    /// Payload value under `name` as an integer.
    pub fn payload_i64(&self, name: &str) -> Option<i64> {
        self.payload_value(name)?.as_i64()
    }

    /// Payload value under `name` as a boolean.
    pub fn payload_bool(&self, name: &str) -> Option<bool> {
        self.payload_value(name)?.as_bool()
    }

    /// Payload value under `name` as a string.
    pub fn payload_str(&self, name: &str) -> Option<&str> {
        self.payload_value(name)?.as_str()
    }
}
