//! Plan tiers and their limits.
//!
//! Ceilings are an injected configuration table, not hard constants: the
//! defaults below match the hosted service's published limits, but operators
//! can override any of them in the server configuration without a redeploy.

use serde::{Deserialize, Serialize};

/// Account plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Business,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits attached to a plan tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Maximum number of topics. `None` means unlimited.
    pub topics: Option<u32>,
    /// Monthly push ceiling.
    pub pushes: i64,
    /// Whether private topics are available on this plan.
    pub private_topics: bool,
    /// Whether webhook subscribers are available on this plan.
    pub webhooks: bool,
}

/// The plan → limits table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTable {
    #[serde(default = "default_free")]
    pub free: PlanLimits,
    #[serde(default = "default_pro")]
    pub pro: PlanLimits,
    #[serde(default = "default_business")]
    pub business: PlanLimits,
}

fn default_free() -> PlanLimits {
    PlanLimits {
        topics: Some(1),
        pushes: 100,
        private_topics: false,
        webhooks: false,
    }
}

fn default_pro() -> PlanLimits {
    PlanLimits {
        topics: Some(10),
        pushes: 10_000,
        private_topics: true,
        webhooks: true,
    }
}

fn default_business() -> PlanLimits {
    PlanLimits {
        topics: None,
        pushes: 100_000,
        private_topics: true,
        webhooks: true,
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            free: default_free(),
            pro: default_pro(),
            business: default_business(),
        }
    }
}

impl PlanTable {
    /// Returns the limits for the given plan.
    pub fn limits(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Business => &self.business,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_published_limits() {
        let table = PlanTable::default();
        assert_eq!(table.limits(Plan::Free).pushes, 100);
        assert_eq!(table.limits(Plan::Pro).pushes, 10_000);
        assert_eq!(table.limits(Plan::Business).pushes, 100_000);
        assert_eq!(table.limits(Plan::Free).topics, Some(1));
        assert_eq!(table.limits(Plan::Business).topics, None);
        assert!(!table.limits(Plan::Free).private_topics);
        assert!(table.limits(Plan::Pro).webhooks);
    }

    #[test]
    fn plan_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Business).unwrap(), "\"business\"");
        let p: Plan = serde_json::from_str("\"pro\"").unwrap();
        assert_eq!(p, Plan::Pro);
    }
}
