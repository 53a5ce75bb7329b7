//! Machine-readable outcome of one verification attempt.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeadEnd;
use crate::rules::{Choice, ChoiceKey, RuleApp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictKind {
    Proved,
    Refuted,
    Unknown,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerdictKind::Proved => "Proved",
            VerdictKind::Refuted => "Refuted",
            VerdictKind::Unknown => "Unknown",
        })
    }
}

/// Everything needed to re-check a proof without searching again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub choices: Vec<(ChoiceKey, Choice)>,
    pub cost_expr: String,
    pub budget_expr: String,
    pub rule_trace: Vec<RuleApp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureReason {
    UnresolvedRelation {
        message: String,
        at: Option<usize>,
    },
    DivergentBranch {
        condition: String,
        /// Compared difference in each run at the witness point.
        witness: Option<(String, String)>,
        at: Option<usize>,
    },
    MisalignedOutput {
        expr: String,
        distance: String,
        at: Option<usize>,
    },
    InvalidNoiseScale {
        scale: String,
        message: String,
        at: Option<usize>,
    },
    UnboundedCost {
        message: String,
        at: Option<usize>,
    },
    BudgetExceeded {
        cost: String,
        budget: String,
        witness: Option<BTreeMap<String, String>>,
    },
    SolverUnknown {
        goal: String,
        reason: String,
    },
    SearchExhausted {
        derivations: usize,
        message: String,
    },
}

impl From<&DeadEnd> for FailureReason {
    fn from(e: &DeadEnd) -> Self {
        let at = e.span().map(|s| s.offset());
        match e {
            DeadEnd::Unresolved { subject, .. } => FailureReason::UnresolvedRelation {
                message: format!("cannot relate the two runs at `{subject}`"),
                at,
            },
            DeadEnd::Divergent {
                condition, witness, ..
            } => FailureReason::DivergentBranch {
                condition: condition.clone(),
                witness: witness.as_ref().map(|w| (w.run_a.clone(), w.run_b.clone())),
                at,
            },
            DeadEnd::Misaligned { expr, distance, .. } => FailureReason::MisalignedOutput {
                expr: expr.clone(),
                distance: distance.clone(),
                at,
            },
            DeadEnd::NoiseScale { scale, problem, .. } => FailureReason::InvalidNoiseScale {
                scale: scale.clone(),
                message: problem.clone(),
                at,
            },
            DeadEnd::Unbounded { reason, .. } => FailureReason::UnboundedCost {
                message: reason.clone(),
                at,
            },
            DeadEnd::SolverUnknown { goal, reason, .. } => FailureReason::SolverUnknown {
                goal: goal.clone(),
                reason: reason.clone(),
            },
            DeadEnd::TooDeep { .. } | DeadEnd::OutOfTime => FailureReason::SearchExhausted {
                derivations: 0,
                message: e.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnresolvedRelation { message, .. } => f.write_str(message),
            FailureReason::DivergentBranch {
                condition, witness, ..
            } => {
                write!(f, "branch on `{condition}` may diverge")?;
                if let Some((a, b)) = witness {
                    write!(f, " (run A compares {a}, run B compares {b})")?;
                }
                Ok(())
            }
            FailureReason::MisalignedOutput { expr, distance, .. } => {
                write!(f, "output `{expr}` differs by {distance}")
            }
            FailureReason::InvalidNoiseScale { scale, message, .. } => {
                write!(f, "Laplace scale `{scale}` {message}")
            }
            FailureReason::UnboundedCost { message, .. } => write!(f, "unbounded loop cost: {message}"),
            FailureReason::BudgetExceeded { cost, budget, .. } => {
                write!(f, "cost {cost} exceeds budget {budget}")
            }
            FailureReason::SolverUnknown { goal, reason } => {
                write!(f, "solver could not decide `{goal}`: {reason}")
            }
            FailureReason::SearchExhausted {
                derivations,
                message,
            } => write!(f, "search exhausted after {derivations} derivations: {message}"),
        }
    }
}

/// Two adjacent inputs whose outputs differ when both runs draw the same
/// noise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    pub parameters: BTreeMap<String, String>,
    pub query_a: Vec<String>,
    pub query_b: Vec<String>,
    pub outputs_a: Vec<String>,
    pub outputs_b: Vec<String>,
}

/// Concrete evidence behind a `Refuted` verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterexample {
    /// Parameter values at which the failure shows.
    pub parameters: BTreeMap<String, String>,
    pub detail: String,
    /// Alignment of the refuted derivation.
    pub choices: Vec<(ChoiceKey, Choice)>,
    pub replay: Replay,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    pub derivations: usize,
    pub choice_points: usize,
    pub solver_queries: u64,
    pub cache_hits: u64,
    pub solver_unknown: u64,
    pub elapsed_ms: u64,
    pub truncated: bool,
    pub prover: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub program: String,
    pub result: VerdictKind,
    pub cost_expr: Option<String>,
    pub budget_expr: String,
    pub rule_trace: Vec<RuleApp>,
    pub failure_reason: Option<FailureReason>,
    pub counterexample: Option<Counterexample>,
    pub certificate: Option<Certificate>,
    pub stats: SearchStats,
}

impl Verdict {
    pub fn is_proved(&self) -> bool {
        self.result == VerdictKind::Proved
    }

    /// Rule names in application order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rule_trace.iter().map(|r| r.rule.name()).collect()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.program, self.result)?;
        if let Some(cost) = &self.cost_expr {
            write!(f, " (cost {cost}, budget {})", self.budget_expr)?;
        }
        if let Some(reason) = &self.failure_reason {
            write!(f, "\n  reason: {reason}")?;
        }
        if let Some(cex) = &self.counterexample {
            write!(f, "\n  counterexample: {}", cex.detail)?;
            for (k, v) in &cex.parameters {
                write!(f, "\n    {k} = {v}")?;
            }
            let r = &cex.replay;
            let list = |xs: &[String]| xs.join(", ");
            write!(f, "\n  run A: query [{}], outputs [{}]", list(&r.query_a), list(&r.outputs_a))?;
            write!(f, "\n  run B: query [{}], outputs [{}]", list(&r.query_b), list(&r.outputs_b))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;

    #[test]
    fn failure_reasons_are_tagged_in_kebab_case() {
        let r = FailureReason::BudgetExceeded {
            cost: "2 * epsilon".into(),
            budget: "epsilon".into(),
            witness: None,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "budget-exceeded");
        assert_eq!(r.to_string(), "cost 2 * epsilon exceeds budget epsilon");
    }

    #[test]
    fn verdict_serialises_result_and_trace() {
        let v = Verdict {
            program: "noisymax".into(),
            result: VerdictKind::Proved,
            cost_expr: Some("epsilon".into()),
            budget_expr: "epsilon".into(),
            rule_trace: vec![RuleApp {
                rule: Rule::LastWinnerLoop,
                at: 12,
            }],
            failure_reason: None,
            counterexample: None,
            certificate: None,
            stats: SearchStats::default(),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["result"], "Proved");
        assert_eq!(json["rule_trace"][0]["rule"], "last-winner-loop");
        assert_eq!(v.rule_names(), vec!["last-winner-loop"]);
        let back: Verdict = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
