use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and knobs of the alignment search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    /// Derivations tried before giving up.
    pub max_derivations: usize,
    /// Choice points allowed in one derivation.
    pub max_depth: usize,
    /// Wall-clock budget for one program, in milliseconds.
    pub time_budget_ms: u64,
    /// Per-query solver timeout, in milliseconds.
    pub solver_timeout_ms: u64,
    /// Loop rounds joined structurally before widening to intervals.
    pub structural_rounds: usize,
    /// Further rounds joined as intervals before giving up on a relation.
    pub hull_rounds: usize,
    /// Constant shifts offered for a noise draw.
    pub shifts: Vec<i64>,
    /// Paths kept apart inside one loop body before they are joined.
    pub max_paths: usize,
    /// Points the built-in prover may sample when looking for a witness.
    pub grid_points: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        SearchProfile::Ci.config()
    }
}

impl VerifyConfig {
    pub fn solver_timeout(&self) -> Duration {
        Duration::from_millis(self.solver_timeout_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProfile {
    /// Small search, short timeouts.
    Fast,
    /// The default.
    Ci,
    /// Wide search, long timeouts.
    Thorough,
}

impl SearchProfile {
    pub fn config(self) -> VerifyConfig {
        let base = VerifyConfig {
            max_derivations: 4_000,
            max_depth: 64,
            time_budget_ms: 60_000,
            solver_timeout_ms: 2_000,
            structural_rounds: 8,
            hull_rounds: 8,
            shifts: vec![1, -1, 2, -2],
            max_paths: 64,
            grid_points: 50_000,
        };
        match self {
            SearchProfile::Fast => VerifyConfig {
                max_derivations: 500,
                time_budget_ms: 10_000,
                solver_timeout_ms: 500,
                grid_points: 5_000,
                ..base
            },
            SearchProfile::Ci => base,
            SearchProfile::Thorough => VerifyConfig {
                max_derivations: 50_000,
                time_budget_ms: 600_000,
                solver_timeout_ms: 20_000,
                shifts: vec![1, -1, 2, -2, 3, -3],
                grid_points: 500_000,
                ..base
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_the_ci_profile() {
        assert_eq!(VerifyConfig::default(), SearchProfile::Ci.config());
        assert_eq!(VerifyConfig::default().max_depth, 64);
    }

    #[test]
    fn profiles_only_change_limits() {
        let fast = SearchProfile::Fast.config();
        let thorough = SearchProfile::Thorough.config();
        assert!(fast.max_derivations < thorough.max_derivations);
        assert_eq!(fast.structural_rounds, thorough.structural_rounds);
    }
}
