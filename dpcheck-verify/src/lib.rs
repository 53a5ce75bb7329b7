//! Alignment-based verification of differential privacy for annotated
//! mechanisms.
//!
//! Two runs of a mechanism on adjacent inputs are tracked together. Every
//! noise draw in the second run is aligned against the first, and the cost
//! of those alignments is bounded symbolically and compared with the
//! mechanism's claimed budget.

#![forbid(unsafe_code)]

mod bounds;
mod config;
mod engine;
mod error;
mod exec;
mod loops;
mod relation;
mod rules;
mod search;
mod solver;
mod state;
mod sym;
mod verdict;

use dpcheck_ast::{Program, SymbolTable};

pub use bounds::{BoundsProver, VarBounds};
pub use config::{SearchProfile, VerifyConfig};
pub use error::{DeadEnd, DivergenceWitness, ExecError, UnsupportedError, VerifyError};
pub use exec::{Machine, find_divergence};
pub use relation::{AdjacencyModel, Distance, Interval, Relation};
pub use rules::{BranchAlignment, Choice, ChoiceKey, LoopRule, NoiseAlignment, Rule, RuleApp};
pub use solver::{AssumptionSet, CmpOp, Domain, Predicate, ProofOutcome, Prover, SolverSession, SolverStats, Witness};
pub use sym::{Point, Poly, Rational, Sym};
pub use verdict::{Certificate, Counterexample, FailureReason, Replay, SearchStats, Verdict, VerdictKind};

#[cfg(feature = "z3")]
pub use solver::z3_prover::Z3Prover;

/// Verifies a validated program with the built-in prover.
pub fn verify_program(program: &Program, symbols: &SymbolTable, config: &VerifyConfig) -> Result<Verdict, VerifyError> {
    let mut prover = BoundsProver::new(config.grid_points);
    verify_with(program, symbols, config, &mut prover)
}

/// Verifies a validated program with the given prover.
pub fn verify_with(
    program: &Program,
    symbols: &SymbolTable,
    config: &VerifyConfig,
    prover: &mut dyn Prover,
) -> Result<Verdict, VerifyError> {
    search::run(program, symbols, config, prover)
}

/// Re-checks a certificate produced by an earlier `Proved` verdict.
pub fn replay(
    program: &Program,
    symbols: &SymbolTable,
    certificate: &Certificate,
    config: &VerifyConfig,
    prover: &mut dyn Prover,
) -> Result<Verdict, VerifyError> {
    search::replay(program, symbols, certificate, config, prover)
}

/// Parses, validates and verifies source text.
pub fn verify_source(src: &str, config: &VerifyConfig) -> miette::Result<Verdict> {
    let (program, symbols) = dpcheck_parse::parse_and_validate(src)?;
    Ok(verify_program(&program, &symbols, config)?)
}
