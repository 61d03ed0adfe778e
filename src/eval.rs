//! Pure evaluation of definitions for a subject.
//!
//! Nothing here performs I/O or reads global state: the same definition and subject always
//! produce the same outcome, in any process.
use crate::{
    definitions::{ExperimentDefinition, FlagDefinition, TOTAL_BUCKETS},
    results::{EvaluationResult, ExperimentResult},
    sharder::{Md5Sharder, Sharder},
    Variant,
};

impl FlagDefinition {
    /// Return whether the flag is on for `subject_id`.
    ///
    /// A subject-level override wins over `default_enabled`.
    pub fn check_enabled(&self, subject_id: Option<&str>) -> bool {
        subject_id
            .and_then(|subject_id| self.overrides.get(subject_id))
            .copied()
            .unwrap_or(self.default_enabled)
    }

    pub(crate) fn eval(&self, subject_id: Option<&str>) -> EvaluationResult {
        EvaluationResult {
            enabled: self.check_enabled(subject_id),
            config: self.config.clone(),
        }
    }
}

impl ExperimentDefinition {
    /// Assign `subject_id` to a variant using the default sharder.
    pub fn assign(&self, subject_id: &str) -> &Variant {
        self.assign_with(subject_id, &Md5Sharder)
    }

    /// Assign `subject_id` to a variant using `sharder`.
    pub fn assign_with(&self, subject_id: &str, sharder: &impl Sharder) -> &Variant {
        let bucket = self.bucket(subject_id, sharder);
        let range = self
            .ranges()
            .iter()
            .find(|range| range.contains(bucket))
            // Ranges partition 0..TOTAL_BUCKETS.
            .unwrap_or(&self.ranges()[0]);
        &range.variant
    }

    /// Bucket of `subject_id` in this experiment, in `0..TOTAL_BUCKETS`.
    pub fn bucket(&self, subject_id: &str, sharder: &impl Sharder) -> u64 {
        sharder.get_bucket(&format!("{}{}", subject_id, self.key()), TOTAL_BUCKETS)
    }

    pub(crate) fn eval(&self, subject_id: &str, sharder: &impl Sharder) -> ExperimentResult {
        let variant = self.assign_with(subject_id, sharder);
        ExperimentResult {
            variant: variant.clone(),
            payload: self.payload(variant).cloned(),
        }
    }
}
