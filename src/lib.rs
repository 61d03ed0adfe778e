//! A client for a remote feature flag and experiment service.
//!
//! # Overview
//!
//! The client answers two questions for application code:
//!
//! - Is feature flag `key` on (optionally for a specific subject), and what config does it carry?
//! - Which variant of experiment `key` is subject `subject_id` assigned to?
//!
//! Flag and experiment definitions are fetched from the service on first use and cached for
//! [`ClientConfig::cache_ttl`]. Concurrent evaluations of the same key share one in-flight fetch.
//! Experiment assignment is computed locally and is deterministic: the same subject lands in the
//! same variant on every call and every process.
//!
//! Two facades share one [`ClientCore`]: the blocking [`SyncClient`] and the async
//! [`AsyncClient`]. Most applications initialize a process-wide core once with [`initialize()`]
//! and resolve it with [`client()`].
//!
//! # Error Handling
//!
//! Flag evaluation should never take an application down. Every operation taking a default
//! returns it when the flag service is unreachable, slow, or answers with garbage, and logs the
//! failure. Operations without a default return the failure as an [`Error`], classified by
//! [`FailureKind`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target
//! `feature_flags`. Consider integrating a `log`-compatible logger implementation for visibility
//! into fetches and fallbacks.
//!
//! # Examples
//!
//! ```no_run
//! use feature_flags::{ClientConfig, Variant};
//!
//! # fn main() -> feature_flags::Result<()> {
//! feature_flags::initialize(ClientConfig::new("http://localhost:8080"))?;
//!
//! let client = feature_flags::client()?.sync_client();
//! if client.is_enabled("new-ui", false) {
//!     // render new UI
//! }
//! let variant = client.get_variant("checkout-flow", "user-123", Variant::Control);
//!
//! feature_flags::cleanup();
//! # Ok(())
//! # }
//! ```
//!
//! More examples can be found in the `demos` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod async_client;
mod cache_store;
mod client;
mod client_core;
mod config;
mod definitions;
mod ergonomics;
mod error;
mod eval;
mod policy;
mod results;
mod sharder;
mod transport;

pub use async_client::AsyncClient;
pub use client::SyncClient;
pub use client_core::{cleanup, client, initialize, initialize_from_env, ClientCore};
pub use config::ClientConfig;
pub use definitions::{ExperimentDefinition, FlagDefinition, SplitRange, TOTAL_BUCKETS};
pub use ergonomics::{
    experiment_variant, feature_flag, ExperimentContext, FeatureFlagged, FeatureToggle, FlagGate,
    VariantGate, VariantInjected,
};
pub use error::{Error, FailureKind, FetchError, Result};
pub use policy::ErrorPolicy;
pub use results::{ConfigMap, EvaluationResult, ExperimentResult, Variant};
pub use sharder::{Md5Sharder, Sharder};
pub use transport::{HttpTransport, Transport};
