//! Proof search: enumerate alignment choices until one derivation fits the
//! budget, or the search runs out.

use std::collections::BTreeMap;
use std::time::Instant;

use dpcheck_ast::{Program, SymbolTable};
use tracing::{debug, info};

use crate::config::VerifyConfig;
use crate::engine::Engine;
use crate::exec;
use crate::error::{DeadEnd, Halt, UnsupportedError, VerifyError};
use crate::relation::AdjacencyModel;
use crate::rules::{Choice, ChoiceKey, Decisions, Rule, RuleApp};
use crate::solver::{AssumptionSet, ProofOutcome, Prover, SolverSession};
use crate::state::{Scope, find_cursor};
use crate::sym::{Point, Sym};
use crate::verdict::{Certificate, Counterexample, FailureReason, Replay, SearchStats, Verdict, VerdictKind};

/// A derivation that did not end in a proof.
#[derive(Clone, Debug)]
struct Failure {
    reason: FailureReason,
    /// Nothing but a change to the program could avoid it.
    concrete: bool,
    /// Counts as a truncated search rather than a failed derivation.
    truncation: bool,
    unknown: bool,
    cost: Option<String>,
    trace: Vec<RuleApp>,
    choices: Vec<(ChoiceKey, Choice)>,
    parameters: Point,
    detail: String,
}

/// What the failed derivations of one search add up to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Tally {
    truncated: bool,
    unknown: bool,
    concrete: bool,
    /// Some derivation failed in a way another alignment might avoid.
    nonconcrete: bool,
}

impl Tally {
    fn record(&mut self, f: &Failure) {
        self.truncated |= f.truncation;
        self.unknown |= f.unknown;
        if f.concrete {
            self.concrete = true;
        } else if !f.truncation && !f.unknown {
            self.nonconcrete = true;
        }
    }

    /// The search finished and every derivation failed concretely.
    fn refutes(&self) -> bool {
        self.concrete && !self.nonconcrete && !self.truncated && !self.unknown
    }
}

enum Outcome {
    Proved { cost: Sym, trace: Vec<RuleApp> },
    Failed(Failure),
}

/// Inputs shared by every derivation of one attempt.
struct Attempt<'a> {
    program: &'a Program,
    scope: Scope<'a>,
    budget: Sym,
    config: &'a VerifyConfig,
    deadline: Instant,
}

fn show_point(point: &Point) -> BTreeMap<String, String> {
    point.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
}

impl<'a> Attempt<'a> {
    fn new(
        program: &'a Program,
        symbols: &'a SymbolTable,
        config: &'a VerifyConfig,
        session: &SolverSession<'_>,
        started: Instant,
    ) -> Result<Self, VerifyError> {
        let unsupported = |message: &str, span| UnsupportedError {
            message: message.to_string(),
            span,
        };
        let budget = Sym::from_expr(&program.annotations.check, &|x| Some(Sym::var(x)))
            .ok_or_else(|| unsupported("CHECK must be a polynomial in the parameters", program.annotations.check.span))?;
        let query = program
            .query_param()
            .ok_or_else(|| unsupported("the first parameter must be the query array", program.name.span))?;
        let length = program
            .length_param()
            .ok_or_else(|| unsupported("the second parameter must be the array length", program.name.span))?;
        let scope = Scope {
            symbols,
            model: AdjacencyModel::new(program.adjacency(), &length.name.node),
            query: query.name.node.clone(),
            cursor: find_cursor(&program.body, &query.name.node),
            positive: session.positive_vars().clone(),
        };
        Ok(Self {
            program,
            scope,
            budget,
            config,
            deadline: started + config.time_budget(),
        })
    }

    fn derive(&self, session: &mut SolverSession<'_>, decisions: &mut Decisions) -> Result<Outcome, VerifyError> {
        decisions.restart();
        let mut engine = Engine::new(self.program, &self.scope, self.config, session, decisions, self.deadline);
        let result = engine.run();
        let mut trace = std::mem::take(&mut engine.trace);
        let choices = decisions.chosen();

        let failure = |reason: FailureReason, trace: Vec<RuleApp>| Failure {
            reason,
            concrete: false,
            truncation: false,
            unknown: false,
            cost: None,
            trace,
            choices: choices.clone(),
            parameters: Point::new(),
            detail: String::new(),
        };

        match result {
            Ok(d) => {
                let budget = self.budget.to_string();
                match session.le(&d.cost, &self.budget) {
                    ProofOutcome::Proved => {
                        trace.push(RuleApp {
                            rule: Rule::BudgetCheck,
                            at: self.program.annotations.check.span.offset(),
                        });
                        Ok(Outcome::Proved { cost: d.cost, trace })
                    }
                    ProofOutcome::Disproved { witness } => {
                        let parameters = witness.as_ref().map(|w| w.assignment.clone());
                        let cost = d.cost.to_string();
                        let mut f = failure(
                            FailureReason::BudgetExceeded {
                                cost: cost.clone(),
                                budget: budget.clone(),
                                witness: parameters.as_ref().map(show_point),
                            },
                            trace,
                        );
                        f.concrete = witness.is_some();
                        f.detail = match &witness {
                            Some(w) => format!("cost {cost} exceeds {budget} at {w}"),
                            None => format!("cost {cost} exceeds {budget}"),
                        };
                        f.parameters = parameters.unwrap_or_default();
                        f.cost = Some(cost);
                        Ok(Outcome::Failed(f))
                    }
                    ProofOutcome::Unknown { reason } => {
                        let mut f = failure(
                            FailureReason::SolverUnknown {
                                goal: format!("{} <= {budget}", d.cost),
                                reason,
                            },
                            trace,
                        );
                        f.unknown = true;
                        f.cost = Some(d.cost.to_string());
                        Ok(Outcome::Failed(f))
                    }
                }
            }
            Err(Halt::Dead(e)) => {
                let mut f = failure(FailureReason::from(&e), trace);
                f.concrete = e.is_concrete();
                f.truncation = e.is_truncation();
                f.unknown = e.is_solver_unknown();
                if let DeadEnd::Divergent {
                    witness: Some(w), ..
                } = &e
                {
                    f.parameters = w.assignment.clone();
                    f.detail = w.to_string();
                } else {
                    f.detail = e.to_string();
                }
                Ok(Outcome::Failed(f))
            }
            Err(Halt::Fatal(e)) => Err(e),
        }
    }

    fn proved(&self, cost: Sym, trace: Vec<RuleApp>, choices: Vec<(ChoiceKey, Choice)>, stats: SearchStats) -> Verdict {
        let cost_expr = cost.to_string();
        let budget_expr = self.budget.to_string();
        Verdict {
            program: self.program.name.node.clone(),
            result: VerdictKind::Proved,
            cost_expr: Some(cost_expr.clone()),
            budget_expr: budget_expr.clone(),
            rule_trace: trace.clone(),
            failure_reason: None,
            counterexample: None,
            certificate: Some(Certificate {
                choices,
                cost_expr,
                budget_expr,
                rule_trace: trace,
            }),
            stats,
        }
    }

    /// Replays a concrete failure on adjacent inputs with identical noise.
    fn reproduce(&self, assumptions: &AssumptionSet, failure: &Failure) -> Option<Replay> {
        exec::find_divergence(self.program, self.scope.symbols, assumptions, &failure.parameters)
    }

    /// `Refuted` when a replay backs the failure, `Unknown` otherwise.
    fn failed(&self, failure: Failure, reason: FailureReason, stats: SearchStats, replay: Option<Replay>) -> Verdict {
        let result = if replay.is_some() {
            VerdictKind::Refuted
        } else {
            VerdictKind::Unknown
        };
        let counterexample = replay.map(|replay| Counterexample {
            parameters: show_point(&failure.parameters),
            detail: failure.detail,
            choices: failure.choices,
            replay,
        });
        Verdict {
            program: self.program.name.node.clone(),
            result,
            cost_expr: failure.cost,
            budget_expr: self.budget.to_string(),
            rule_trace: failure.trace,
            failure_reason: Some(reason),
            counterexample,
            certificate: None,
            stats,
        }
    }
}

fn session_for<'p>(
    program: &Program,
    symbols: &SymbolTable,
    config: &VerifyConfig,
    prover: &'p mut dyn Prover,
) -> Result<SolverSession<'p>, VerifyError> {
    let assumptions = AssumptionSet::from_program(program, symbols).ok_or_else(|| UnsupportedError {
        message: "ASSUME conditions must compare polynomials in the parameters".to_string(),
        span: program.annotations.precondition.span,
    })?;
    Ok(SolverSession::new(prover, assumptions, config.solver_timeout()))
}

fn stats(session: &SolverSession<'_>, derivations: usize, choice_points: usize, started: Instant, truncated: bool) -> SearchStats {
    SearchStats {
        derivations,
        choice_points,
        solver_queries: session.stats.queries,
        cache_hits: session.stats.cache_hits,
        solver_unknown: session.stats.unknown,
        elapsed_ms: started.elapsed().as_millis() as u64,
        truncated,
        prover: session.prover_name().to_string(),
    }
}

/// Searches for an alignment proof of `program` within `config`'s limits.
pub fn run(
    program: &Program,
    symbols: &SymbolTable,
    config: &VerifyConfig,
    prover: &mut dyn Prover,
) -> Result<Verdict, VerifyError> {
    let started = Instant::now();
    let mut session = session_for(program, symbols, config, prover)?;
    let attempt = Attempt::new(program, symbols, config, &session, started)?;
    let mut decisions = Decisions::new();

    let mut derivations = 0;
    let mut choice_points = 0;
    let mut tally = Tally::default();
    let mut first_concrete: Option<Failure> = None;
    let mut deepest: Option<Failure> = None;

    loop {
        if derivations >= config.max_derivations || Instant::now() > attempt.deadline {
            tally.truncated = true;
            break;
        }
        derivations += 1;
        let outcome = attempt.derive(&mut session, &mut decisions)?;
        choice_points = choice_points.max(decisions.depth());
        match outcome {
            Outcome::Proved { cost, trace } => {
                let verdict = attempt.proved(
                    cost,
                    trace,
                    decisions.chosen(),
                    stats(&session, derivations, choice_points, started, false),
                );
                info!(program = %verdict.program, result = %verdict.result, derivations, "verdict");
                return Ok(verdict);
            }
            Outcome::Failed(f) => {
                debug!(derivation = derivations, reason = %f.reason, "dead end");
                tally.record(&f);
                if f.concrete && first_concrete.is_none() {
                    first_concrete = Some(f.clone());
                }
                if deepest.as_ref().is_none_or(|d| f.trace.len() > d.trace.len()) {
                    deepest = Some(f);
                }
            }
        }
        if !decisions.advance() {
            break;
        }
    }

    let stats = stats(&session, derivations, choice_points, started, tally.truncated);
    let replay = if tally.refutes() {
        let replay = first_concrete
            .as_ref()
            .and_then(|f| attempt.reproduce(session.assumptions(), f));
        if replay.is_none() {
            debug!("no concrete run reproduces the failure");
        }
        replay
    } else {
        None
    };
    let best = if replay.is_some() { first_concrete } else { deepest };
    let verdict = match best {
        Some(f) => {
            let reason = if tally.truncated {
                FailureReason::SearchExhausted {
                    derivations,
                    message: f.reason.to_string(),
                }
            } else {
                f.reason.clone()
            };
            attempt.failed(f, reason, stats, replay)
        }
        None => Verdict {
            program: program.name.node.clone(),
            result: VerdictKind::Unknown,
            cost_expr: None,
            budget_expr: attempt.budget.to_string(),
            rule_trace: Vec::new(),
            failure_reason: Some(FailureReason::SearchExhausted {
                derivations,
                message: "no derivation was attempted".to_string(),
            }),
            counterexample: None,
            certificate: None,
            stats,
        },
    };
    info!(program = %verdict.program, result = %verdict.result, derivations, "verdict");
    Ok(verdict)
}

/// Re-checks a certificate: one derivation with the recorded choices, then
/// the budget check. Nothing is searched.
pub fn replay(
    program: &Program,
    symbols: &SymbolTable,
    certificate: &Certificate,
    config: &VerifyConfig,
    prover: &mut dyn Prover,
) -> Result<Verdict, VerifyError> {
    let started = Instant::now();
    let mut session = session_for(program, symbols, config, prover)?;
    let attempt = Attempt::new(program, symbols, config, &session, started)?;
    let mut decisions = Decisions::replay(&certificate.choices);
    let outcome = attempt.derive(&mut session, &mut decisions)?;
    let stats = stats(&session, 1, decisions.depth(), started, false);
    Ok(match outcome {
        Outcome::Proved { cost, trace } => attempt.proved(cost, trace, decisions.chosen(), stats),
        Outcome::Failed(f) => {
            let reason = f.reason.clone();
            attempt.failed(f, reason, stats, None)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(concrete: bool, truncation: bool, unknown: bool) -> Failure {
        Failure {
            reason: FailureReason::UnresolvedRelation {
                message: "x".to_string(),
                at: None,
            },
            concrete,
            truncation,
            unknown,
            cost: None,
            trace: Vec::new(),
            choices: Vec::new(),
            parameters: Point::new(),
            detail: String::new(),
        }
    }

    fn tally(failures: &[Failure]) -> Tally {
        let mut t = Tally::default();
        for f in failures {
            t.record(f);
        }
        t
    }

    #[test]
    fn every_derivation_failing_concretely_refutes() {
        assert!(tally(&[failure(true, false, false), failure(true, false, false)]).refutes());
    }

    #[test]
    fn one_unresolved_derivation_keeps_the_verdict_unknown() {
        let over_budget = failure(true, false, false);
        let unresolved = failure(false, false, false);
        let t = tally(&[over_budget, unresolved]);
        assert!(t.concrete && t.nonconcrete);
        assert!(!t.refutes());
    }

    #[test]
    fn truncation_or_solver_unknown_blocks_refutation() {
        assert!(!tally(&[failure(true, false, false), failure(false, true, false)]).refutes());
        assert!(!tally(&[failure(true, false, false), failure(false, false, true)]).refutes());
    }

    #[test]
    fn no_failures_refute_nothing() {
        assert!(!Tally::default().refutes());
        assert!(!tally(&[failure(false, false, false)]).refutes());
    }
}
