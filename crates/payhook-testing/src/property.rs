//! Shared proptest configuration and strategies.

use payhook_core::Priority;
use proptest::prelude::*;

/// Proptest configuration honouring `PROPTEST_CASES`.
///
/// Defaults to 64 cases so property suites stay fast in CI. Failure
/// persistence is off because the suites run from several crates.
pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES").ok().and_then(|v| v.parse().ok()).unwrap_or(64);
    ProptestConfig { cases, failure_persistence: None, ..ProptestConfig::default() }
}

/// Any priority tier.
pub fn priority() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}

/// Provider-style event ids.
pub fn event_id() -> impl Strategy<Value = String> {
    "evt_[a-z0-9]{1,16}"
}
