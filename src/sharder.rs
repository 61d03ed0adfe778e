//! Stable hashing of subjects into buckets.

/// Maps an input string to one of `total_buckets` buckets.
///
/// Implementations must be pure: the same input always lands in the same bucket, in every process.
pub trait Sharder {
    /// Return the bucket for `input`, in `0..total_buckets`.
    fn get_bucket(&self, input: &str, total_buckets: u64) -> u64;
}

/// The default sharder. Uses the first four bytes of the MD5 digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_bucket(&self, input: &str, total_buckets: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        u64::from(value) % total_buckets
    }
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_bucket(&self, input: &str, total_buckets: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_buckets
    }
}

#[cfg(test)]
mod tests {
    use crate::sharder::{Md5Sharder, Sharder};

    #[test]
    fn test_md5_sharder() {
        assert_eq!(Md5Sharder.get_bucket("test-input", 10_000), 5619);
        assert_eq!(Md5Sharder.get_bucket("alice", 10_000), 3170);
        assert_eq!(Md5Sharder.get_bucket("bob", 10_000), 7420);
        assert_eq!(Md5Sharder.get_bucket("charlie", 10_000), 7497);
    }

    #[test]
    fn buckets_stay_in_range() {
        for i in 0..1_000 {
            assert!(Md5Sharder.get_bucket(&format!("user-{i}"), 100) < 100);
        }
    }
}
