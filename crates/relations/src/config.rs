//! Relation configuration types and builders

use serde::{Deserialize, Serialize};
use service_builder::builder;

/// What happens to a fetch that failed or found nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the settled fetch; callers see the same failure until they
    /// clear the relation explicitly
    #[default]
    Sticky,
    /// Drop the settled fetch so the next call starts a new one
    Reset,
}

/// Configuration shared by all relation kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[builder]
pub struct RelationConfig {
    /// Handling of failed or empty fetches
    #[builder(default = "FailurePolicy::Sticky", getter)]
    failure_policy: FailurePolicy,

    /// Reject fetched records whose key differs from the requested key
    #[builder(default = "true", getter)]
    verify_fetched_keys: bool,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Sticky,
            verify_fetched_keys: true,
        }
    }
}

impl RelationConfig {
    pub(crate) fn resets_failures(&self) -> bool {
        self.failure_policy == FailurePolicy::Reset
    }
}

impl RelationConfigBuilder {
    /// Development configuration: failures stick so they stay visible
    pub fn development() -> Self {
        RelationConfigBuilder::new()
            .failure_policy(FailurePolicy::Sticky)
            .verify_fetched_keys(true)
    }

    /// Production configuration: transient fetch failures are retried on the next call
    pub fn production() -> Self {
        RelationConfigBuilder::new()
            .failure_policy(FailurePolicy::Reset)
            .verify_fetched_keys(true)
    }
}
