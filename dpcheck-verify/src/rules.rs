//! Proof rules, choice points and the decisions that pick among them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    Sequence,
    DeterministicAssign,
    NoiseDraw,
    Lockstep,
    OneSidedShift,
    Cancel,
    SameBranch,
    NoisyThreshold,
    CaseSplit,
    ZeroCostLoop,
    CountedLoop,
    LastWinnerLoop,
    AlignedOutput,
    BudgetCheck,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Rule::Sequence => "sequence",
            Rule::DeterministicAssign => "deterministic-assign",
            Rule::NoiseDraw => "noise-draw",
            Rule::Lockstep => "lockstep",
            Rule::OneSidedShift => "one-sided-shift",
            Rule::Cancel => "cancel",
            Rule::SameBranch => "same-branch",
            Rule::NoisyThreshold => "noisy-threshold",
            Rule::CaseSplit => "case-split",
            Rule::ZeroCostLoop => "zero-cost-loop",
            Rule::CountedLoop => "counted-loop",
            Rule::LastWinnerLoop => "last-winner-loop",
            Rule::AlignedOutput => "aligned-output",
            Rule::BudgetCheck => "budget-check",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One rule applied at a source offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleApp {
    pub rule: Rule,
    pub at: usize,
}

impl fmt::Display for RuleApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.rule, self.at)
    }
}

/// Identifies a choice point: the statement it belongs to and a slot inside
/// that statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChoiceKey {
    pub site: usize,
    pub slot: u32,
}

impl ChoiceKey {
    /// The `j`-th pending draw of an assignment.
    pub fn noise(site: usize, j: usize) -> Self {
        Self {
            site,
            slot: j as u32,
        }
    }

    pub fn branch(site: usize, polarity: bool) -> Self {
        Self {
            site,
            slot: if polarity { 1 } else { 2 },
        }
    }

    pub fn loop_rule(site: usize) -> Self {
        Self { site, slot: 0 }
    }
}

impl fmt::Display for ChoiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.site, self.slot)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseAlignment {
    /// Same sample in both runs.
    Lockstep,
    /// Shift so the expression has no distance left.
    Cancel,
    /// Shift by a constant.
    Shift(i64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchAlignment {
    /// Smallest shift that keeps every comparison's outcome.
    Computed,
    /// Cancel the compared expression outright.
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopRule {
    ZeroCost,
    /// The per-iteration cost is bounded by a rate times the growth of
    /// `meter`, and the meter's total growth is bounded.
    Counted { meter: String, from_break: bool },
    LastWinner,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "choice", rename_all = "kebab-case")]
pub enum Choice {
    Noise(NoiseAlignment),
    Branch(BranchAlignment),
    Loop(LoopRule),
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Noise(NoiseAlignment::Lockstep) => f.write_str("lockstep"),
            Choice::Noise(NoiseAlignment::Cancel) => f.write_str("cancel"),
            Choice::Noise(NoiseAlignment::Shift(n)) => write!(f, "shift({n})"),
            Choice::Branch(BranchAlignment::Computed) => f.write_str("computed"),
            Choice::Branch(BranchAlignment::Cancel) => f.write_str("cancel"),
            Choice::Loop(LoopRule::ZeroCost) => f.write_str("zero-cost"),
            Choice::Loop(LoopRule::Counted { meter, from_break }) => {
                let via = if *from_break { "break" } else { "guard" };
                write!(f, "counted({meter} via {via})")
            }
            Choice::Loop(LoopRule::LastWinner) => f.write_str("last-winner"),
        }
    }
}

#[derive(Clone, Debug)]
struct Decision {
    key: ChoiceKey,
    options: Vec<Choice>,
    picked: usize,
}

/// Why a choice could not be made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChoiceError {
    TooDeep { limit: usize },
    /// Replaying a certificate that has no entry for this key.
    Missing { key: ChoiceKey },
}

/// The choices of one derivation, enumerated like an odometer: the most
/// recently discovered choice point turns fastest.
#[derive(Clone, Debug, Default)]
pub struct Decisions {
    made: Vec<Decision>,
    index: BTreeMap<ChoiceKey, usize>,
    /// Seen in the current derivation.
    used: BTreeMap<ChoiceKey, usize>,
    frozen: bool,
}

impl Decisions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed choices from a certificate; nothing is ever enumerated.
    pub fn replay(choices: &[(ChoiceKey, Choice)]) -> Self {
        let mut out = Self {
            frozen: true,
            ..Self::default()
        };
        for (key, choice) in choices {
            out.index.insert(*key, out.made.len());
            out.made.push(Decision {
                key: *key,
                options: vec![choice.clone()],
                picked: 0,
            });
        }
        out
    }

    /// Called before each derivation.
    pub fn restart(&mut self) {
        self.used.clear();
    }

    /// Choice for `key`, registering the choice point on first sight.
    pub fn choose(
        &mut self,
        key: ChoiceKey,
        options: impl FnOnce() -> Vec<Choice>,
        max_depth: usize,
    ) -> Result<Choice, ChoiceError> {
        if let Some(&i) = self.index.get(&key) {
            let d = &self.made[i];
            self.used.insert(key, i);
            return Ok(d.options[d.picked].clone());
        }
        if self.frozen {
            return Err(ChoiceError::Missing { key });
        }
        if self.made.len() >= max_depth {
            return Err(ChoiceError::TooDeep { limit: max_depth });
        }
        let options = options();
        let choice = options.first().cloned().ok_or(ChoiceError::Missing { key })?;
        self.index.insert(key, self.made.len());
        self.used.insert(key, self.made.len());
        self.made.push(Decision {
            key,
            options,
            picked: 0,
        });
        Ok(choice)
    }

    /// Moves to the next combination. Choice points the last derivation never
    /// reached are forgotten first. Returns `false` once every combination has
    /// been tried.
    pub fn advance(&mut self) -> bool {
        if self.frozen {
            return false;
        }
        let keep = self.made.len().min(self.used.values().map(|&i| i + 1).max().unwrap_or(0));
        self.truncate(keep);
        while let Some(last) = self.made.last_mut() {
            if last.picked + 1 < last.options.len() {
                last.picked += 1;
                return true;
            }
            let len = self.made.len();
            self.truncate(len - 1);
        }
        false
    }

    fn truncate(&mut self, len: usize) {
        for d in self.made.drain(len..) {
            self.index.remove(&d.key);
        }
        self.used.retain(|_, i| *i < len);
    }

    pub fn depth(&self) -> usize {
        self.made.len()
    }

    /// The choices the current derivation used, in discovery order.
    pub fn chosen(&self) -> Vec<(ChoiceKey, Choice)> {
        self.made
            .iter()
            .filter(|d| self.used.contains_key(&d.key))
            .map(|d| (d.key, d.options[d.picked].clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_options() -> Vec<Choice> {
        vec![
            Choice::Noise(NoiseAlignment::Lockstep),
            Choice::Noise(NoiseAlignment::Shift(1)),
        ]
    }

    fn branch_options() -> Vec<Choice> {
        vec![
            Choice::Branch(BranchAlignment::Computed),
            Choice::Branch(BranchAlignment::Cancel),
        ]
    }

    #[test]
    fn rule_names_are_kebab_case() {
        assert_eq!(Rule::LastWinnerLoop.name(), "last-winner-loop");
        assert_eq!(
            serde_json::to_string(&Rule::OneSidedShift).unwrap(),
            "\"one-sided-shift\""
        );
    }

    #[test]
    fn enumerates_every_combination_once() {
        let mut d = Decisions::new();
        let mut seen = Vec::new();
        loop {
            d.restart();
            let a = d.choose(ChoiceKey::noise(1, 0), noise_options, 64).unwrap();
            let b = d.choose(ChoiceKey::branch(9, true), branch_options, 64).unwrap();
            seen.push((a, b));
            if !d.advance() {
                break;
            }
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1].0, Choice::Noise(NoiseAlignment::Lockstep));
        assert_eq!(seen[1].1, Choice::Branch(BranchAlignment::Cancel));
        assert_eq!(seen[2].0, Choice::Noise(NoiseAlignment::Shift(1)));
    }

    #[test]
    fn forgets_choice_points_that_were_not_reached() {
        let mut d = Decisions::new();
        d.restart();
        d.choose(ChoiceKey::noise(1, 0), noise_options, 64).unwrap();
        d.choose(ChoiceKey::branch(9, true), branch_options, 64).unwrap();
        assert!(d.advance());

        // This derivation stops before reaching the branch.
        d.restart();
        d.choose(ChoiceKey::noise(1, 0), noise_options, 64).unwrap();
        assert!(d.advance());
        assert_eq!(d.depth(), 1);
        d.restart();
        assert_eq!(
            d.choose(ChoiceKey::noise(1, 0), noise_options, 64).unwrap(),
            Choice::Noise(NoiseAlignment::Shift(1))
        );
    }

    #[test]
    fn depth_limit_stops_new_choice_points() {
        let mut d = Decisions::new();
        d.restart();
        d.choose(ChoiceKey::noise(1, 0), noise_options, 1).unwrap();
        assert_eq!(
            d.choose(ChoiceKey::noise(2, 0), noise_options, 1),
            Err(ChoiceError::TooDeep { limit: 1 })
        );
    }

    #[test]
    fn replay_returns_recorded_choices_only() {
        let mut d = Decisions::replay(&[(ChoiceKey::loop_rule(4), Choice::Loop(LoopRule::LastWinner))]);
        d.restart();
        assert_eq!(
            d.choose(ChoiceKey::loop_rule(4), Vec::new, 64).unwrap(),
            Choice::Loop(LoopRule::LastWinner)
        );
        assert!(matches!(
            d.choose(ChoiceKey::noise(8, 0), noise_options, 64),
            Err(ChoiceError::Missing { .. })
        ));
        assert!(!d.advance());
    }
}
