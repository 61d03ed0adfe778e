//! Flag and experiment definitions as served by the flag service.
//!
//! Definitions are immutable. A refresh replaces the cached definition wholesale.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{error::FetchError, results::ConfigMap, Variant};

/// Width of the bucket space traffic splits are expressed in.
pub const TOTAL_BUCKETS: u64 = 100;

/// A feature flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    /// Flag key. Filled from the requested key when the service omits it.
    #[serde(default)]
    pub key: String,
    /// State for subjects without an override.
    #[serde(rename = "enabled")]
    pub default_enabled: bool,
    /// Config attached to the flag, if any.
    #[serde(default)]
    pub config: Option<ConfigMap>,
    /// Per-subject state, keyed by subject id. Takes precedence over `default_enabled`.
    #[serde(default)]
    pub overrides: HashMap<String, bool>,
}

impl FlagDefinition {
    /// Create a flag without config or overrides.
    pub fn new(key: impl Into<String>, default_enabled: bool) -> FlagDefinition {
        FlagDefinition {
            key: key.into(),
            default_enabled,
            config: None,
            overrides: HashMap::new(),
        }
    }

    /// Attach `config` to the flag.
    pub fn with_config(mut self, config: ConfigMap) -> FlagDefinition {
        self.config = Some(config);
        self
    }

    /// Force the flag to `enabled` for `subject_id`.
    pub fn with_override(mut self, subject_id: impl Into<String>, enabled: bool) -> FlagDefinition {
        self.overrides.insert(subject_id.into(), enabled);
        self
    }
}

/// One variant's slice of the bucket space: `start..end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRange {
    /// Variant assigned to buckets in this range.
    pub variant: Variant,
    /// First bucket, inclusive.
    pub start: u64,
    /// Last bucket, exclusive.
    pub end: u64,
}

impl SplitRange {
    /// Returns whether `bucket` falls in this range.
    pub fn contains(&self, bucket: u64) -> bool {
        self.start <= bucket && bucket < self.end
    }
}

/// An A/B(/n) experiment.
///
/// Invariant: `ranges` are ordered by variant (control, treatment, then others by name), are
/// contiguous, and cover `0..TOTAL_BUCKETS` exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDefinition {
    key: String,
    ranges: Vec<SplitRange>,
    payloads: HashMap<Variant, ConfigMap>,
}

impl ExperimentDefinition {
    /// Build an experiment from per-variant percentages.
    ///
    /// Percentages must sum to exactly 100, and both `control` and `treatment` must be present
    /// (a zero weight is allowed).
    ///
    /// ```
    /// # use feature_flags::{ExperimentDefinition, Variant};
    /// let experiment = ExperimentDefinition::new(
    ///     "checkout-flow",
    ///     [(Variant::Control, 50), (Variant::Treatment, 50)],
    /// )
    /// .unwrap();
    /// assert_eq!(experiment.ranges()[1].start, 50);
    /// ```
    pub fn new(
        key: impl Into<String>,
        traffic_split: impl IntoIterator<Item = (Variant, u64)>,
    ) -> Result<ExperimentDefinition, FetchError> {
        let key = key.into();

        // BTreeMap orders variants as control < treatment < other names.
        let mut weights = BTreeMap::new();
        for (variant, weight) in traffic_split {
            let variant = variant.canonical();
            if weights.insert(variant.clone(), weight).is_some() {
                return Err(FetchError::BadResponse(format!(
                    "experiment `{key}` lists variant `{variant}` twice"
                )));
            }
        }

        if !weights.contains_key(&Variant::Control) || !weights.contains_key(&Variant::Treatment)
        {
            return Err(FetchError::BadResponse(format!(
                "experiment `{key}` must define both control and treatment"
            )));
        }

        let mut ranges = Vec::with_capacity(weights.len());
        let mut start = 0u64;
        for (variant, weight) in weights {
            let end = start.saturating_add(weight);
            ranges.push(SplitRange {
                variant,
                start,
                end,
            });
            start = end;
        }

        if start != TOTAL_BUCKETS {
            return Err(FetchError::BadResponse(format!(
                "traffic split of experiment `{key}` sums to {start}, expected {TOTAL_BUCKETS}"
            )));
        }

        Ok(ExperimentDefinition {
            key,
            ranges,
            payloads: HashMap::new(),
        })
    }

    /// Attach a payload to `variant`.
    pub fn with_payload(mut self, variant: Variant, payload: ConfigMap) -> ExperimentDefinition {
        self.payloads.insert(variant.canonical(), payload);
        self
    }

    /// Experiment key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bucket ranges in evaluation order.
    pub fn ranges(&self) -> &[SplitRange] {
        &self.ranges
    }

    /// Variants in evaluation order.
    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.ranges.iter().map(|range| &range.variant)
    }

    /// Payload attached to `variant`, if any.
    pub fn payload(&self, variant: &Variant) -> Option<&ConfigMap> {
        self.payloads.get(variant)
    }
}

/// Experiment body returned by `GET /experiments/{key}`.
///
/// The service reports the variant it assigned to the requesting subject together with that
/// variant's payload. Payloads of other variants may be listed under `payloads`.
#[derive(Debug, Deserialize)]
pub(crate) struct ExperimentResponse {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    variant: Option<Variant>,
    #[serde(default)]
    payload: Option<ConfigMap>,
    traffic_split: HashMap<Variant, u64>,
    #[serde(default)]
    payloads: HashMap<Variant, ConfigMap>,
}

impl ExperimentResponse {
    /// Validate the response and turn it into a definition. `requested_key` wins over the key in
    /// the body.
    pub(crate) fn into_definition(
        self,
        requested_key: &str,
    ) -> Result<ExperimentDefinition, FetchError> {
        if let Some(key) = self.key.as_deref() {
            if key != requested_key {
                log::debug!(target: "feature_flags",
                            requested_key,
                            response_key = key;
                            "experiment key in response differs from the requested one");
            }
        }

        let mut payloads = self.payloads;
        match (self.variant, self.payload) {
            (Some(variant), Some(payload)) => {
                payloads.entry(variant).or_insert(payload);
            }
            (None, Some(_)) => {
                log::debug!(target: "feature_flags",
                            key = requested_key;
                            "experiment payload without a variant, ignoring it");
            }
            _ => {}
        }

        let mut definition = ExperimentDefinition::new(requested_key, self.traffic_split)?;
        for (variant, payload) in payloads {
            if !definition.ranges.iter().any(|range| range.variant == variant) {
                return Err(FetchError::BadResponse(format!(
                    "payload for unknown variant `{variant}` in experiment `{requested_key}`"
                )));
            }
            definition.payloads.insert(variant, payload);
        }
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ExperimentDefinition, ExperimentResponse, FlagDefinition};
    use crate::{FailureKind, Variant};

    #[test]
    fn ranges_follow_fixed_variant_order() {
        let experiment = ExperimentDefinition::new(
            "search-ranking",
            [
                (Variant::Other("b-arm".to_owned()), 20),
                (Variant::Treatment, 30),
                (Variant::Other("a-arm".to_owned()), 10),
                (Variant::Control, 40),
            ],
        )
        .unwrap();

        let bounds: Vec<_> = experiment
            .ranges()
            .iter()
            .map(|range| (range.variant.as_str(), range.start, range.end))
            .collect();
        assert_eq!(
            bounds,
            vec![
                ("control", 0, 40),
                ("treatment", 40, 70),
                ("a-arm", 70, 80),
                ("b-arm", 80, 100),
            ]
        );
    }

    #[test]
    fn split_must_sum_to_100() {
        let err = ExperimentDefinition::new(
            "broken",
            [(Variant::Control, 50), (Variant::Treatment, 40)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::BadResponse);
    }

    #[test]
    fn split_must_contain_control_and_treatment() {
        let err = ExperimentDefinition::new(
            "no-treatment",
            [(Variant::Control, 50), (Variant::from("other"), 50)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::BadResponse);
    }

    #[test]
    fn parse_experiment_response() {
        let response: ExperimentResponse = serde_json::from_value(json!({
            "traffic_split": {"treatment": 50, "control": 50},
            "payloads": {"treatment": {"discount": 0.15}}
        }))
        .unwrap();

        let experiment = response.into_definition("pricing-test").unwrap();
        assert_eq!(experiment.key(), "pricing-test");
        assert_eq!(
            experiment
                .payload(&Variant::Treatment)
                .and_then(|p| p.get("discount")),
            Some(&json!(0.15))
        );
        assert_eq!(experiment.payload(&Variant::Control), None);
    }

    #[test]
    fn reserved_names_in_other_are_normalized() {
        let experiment = ExperimentDefinition::new(
            "checkout-flow",
            [
                (Variant::Other("control".to_owned()), 50),
                (Variant::Other("treatment".to_owned()), 50),
            ],
        )
        .unwrap()
        .with_payload(Variant::Other("treatment".to_owned()), Default::default());

        assert_eq!(
            experiment.variants().cloned().collect::<Vec<_>>(),
            vec![Variant::Control, Variant::Treatment]
        );
        assert!(experiment.payload(&Variant::Treatment).is_some());
    }

    #[test]
    fn parse_assigned_variant_payload() {
        let response: ExperimentResponse = serde_json::from_value(json!({
            "variant": "treatment",
            "payload": {"discount": 0.15},
            "traffic_split": {"control": 50, "treatment": 50}
        }))
        .unwrap();

        let experiment = response.into_definition("pricing-test").unwrap();
        assert_eq!(
            experiment
                .payload(&Variant::Treatment)
                .and_then(|p| p.get("discount")),
            Some(&json!(0.15))
        );
        assert_eq!(experiment.payload(&Variant::Control), None);
    }

    #[test]
    fn null_payload_is_absent() {
        let response: ExperimentResponse = serde_json::from_value(json!({
            "variant": "control",
            "payload": null,
            "traffic_split": {"control": 50, "treatment": 50}
        }))
        .unwrap();

        let experiment = response.into_definition("pricing-test").unwrap();
        assert_eq!(experiment.payload(&Variant::Control), None);
    }

    #[test]
    fn assigned_variant_must_be_in_split() {
        let response: ExperimentResponse = serde_json::from_value(json!({
            "variant": "ghost",
            "payload": {"discount": 0.15},
            "traffic_split": {"control": 50, "treatment": 50}
        }))
        .unwrap();

        let err = response.into_definition("pricing-test").unwrap_err();
        assert_eq!(err.kind(), FailureKind::BadResponse);
    }

    #[test]
    fn payload_for_unknown_variant_is_rejected() {
        let response: ExperimentResponse = serde_json::from_value(json!({
            "traffic_split": {"control": 50, "treatment": 50},
            "payloads": {"ghost": {}}
        }))
        .unwrap();

        assert!(response.into_definition("pricing-test").is_err());
    }

    #[test]
    fn parse_flag_response() {
        let flag: FlagDefinition = serde_json::from_value(json!({
            "enabled": false,
            "config": null,
            "overrides": {"user-1": true}
        }))
        .unwrap();

        assert!(!flag.default_enabled);
        assert_eq!(flag.config, None);
        assert_eq!(flag.overrides.get("user-1"), Some(&true));
        assert_eq!(flag.key, "");
    }
}
