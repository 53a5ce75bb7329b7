#![allow(unused_assignments)]

use std::fmt;

use dpcheck_ast::{MalformedProgramError, Span};
use miette::Diagnostic;
use thiserror::Error;

use crate::sym::Point;

/// Errors that stop verification before any derivation is attempted.
#[derive(Debug, Error, Diagnostic)]
pub enum VerifyError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Malformed(#[from] MalformedProgramError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Unsupported(#[from] UnsupportedError),
}

#[derive(Debug, Error, Diagnostic)]
#[error("unsupported construct: {message}")]
#[diagnostic(code(dpcheck::unsupported))]
#[allow(unused_assignments)]
pub struct UnsupportedError {
    pub message: String,
    #[label]
    pub span: Span,
}

/// Concrete evidence that a branch outcome can differ between the runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DivergenceWitness {
    pub condition: String,
    /// Compared difference in the first run, at the boundary.
    pub run_a: String,
    /// The same difference in the second run.
    pub run_b: String,
    pub assignment: Point,
}

impl fmt::Display for DivergenceWitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: run A at {}, run B at {}", self.condition, self.run_a, self.run_b)?;
        if !self.assignment.is_empty() {
            f.write_str(" with ")?;
            for (i, (k, v)) in self.assignment.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{k} = {v}")?;
            }
        }
        Ok(())
    }
}

/// Why one derivation could not be completed. Other choices may still work.
#[derive(Clone, Debug, Error, Diagnostic)]
pub enum DeadEnd {
    #[error("cannot relate the two runs at `{subject}`")]
    #[diagnostic(code(dpcheck::unresolved_relation))]
    Unresolved {
        subject: String,
        #[label]
        span: Span,
    },

    #[error("branch on `{condition}` may take different directions in the two runs")]
    #[diagnostic(code(dpcheck::divergent_branch))]
    Divergent {
        condition: String,
        witness: Option<DivergenceWitness>,
        /// No noise was involved, so no other alignment can help.
        concrete: bool,
        #[label]
        span: Span,
    },

    #[error("output `{expr}` differs between the runs by {distance}")]
    #[diagnostic(code(dpcheck::misaligned_output))]
    Misaligned {
        expr: String,
        distance: String,
        #[label]
        span: Span,
    },

    #[error("Laplace scale `{scale}` {problem}")]
    #[diagnostic(code(dpcheck::noise_scale))]
    NoiseScale {
        scale: String,
        problem: String,
        /// The scale is provably not positive.
        concrete: bool,
        #[label]
        span: Span,
    },

    #[error("cost of this loop is not bounded: {reason}")]
    #[diagnostic(code(dpcheck::unbounded_cost))]
    Unbounded {
        reason: String,
        #[label]
        span: Span,
    },

    #[error("solver could not decide `{goal}`: {reason}")]
    #[diagnostic(code(dpcheck::solver_unknown))]
    SolverUnknown {
        goal: String,
        reason: String,
        #[label]
        span: Span,
    },

    #[error("more than {limit} choice points in one derivation")]
    #[diagnostic(code(dpcheck::too_deep))]
    TooDeep { limit: usize },

    #[error("time budget exhausted")]
    #[diagnostic(code(dpcheck::out_of_time))]
    OutOfTime,
}

impl DeadEnd {
    pub fn span(&self) -> Option<Span> {
        match self {
            DeadEnd::Unresolved { span, .. }
            | DeadEnd::Divergent { span, .. }
            | DeadEnd::Misaligned { span, .. }
            | DeadEnd::NoiseScale { span, .. }
            | DeadEnd::Unbounded { span, .. }
            | DeadEnd::SolverUnknown { span, .. } => Some(*span),
            DeadEnd::TooDeep { .. } | DeadEnd::OutOfTime => None,
        }
    }

    /// A failure no other choice of alignments can avoid.
    pub fn is_concrete(&self) -> bool {
        matches!(
            self,
            DeadEnd::Divergent { concrete: true, .. } | DeadEnd::NoiseScale { concrete: true, .. }
        )
    }

    pub fn is_solver_unknown(&self) -> bool {
        matches!(self, DeadEnd::SolverUnknown { .. })
    }

    /// The search itself was cut short.
    pub fn is_truncation(&self) -> bool {
        matches!(self, DeadEnd::TooDeep { .. } | DeadEnd::OutOfTime)
    }
}

/// Why a concrete run of a program stopped early.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    #[error("`{name}` has no value")]
    #[diagnostic(code(dpcheck::exec::unbound))]
    Unbound {
        name: String,
        #[label]
        span: Span,
    },

    #[error("index {index} is outside the query array of length {len}")]
    #[diagnostic(code(dpcheck::exec::out_of_bounds))]
    OutOfBounds {
        index: String,
        len: usize,
        #[label]
        span: Span,
    },

    #[error("division by zero")]
    #[diagnostic(code(dpcheck::exec::division_by_zero))]
    DivisionByZero {
        #[label]
        span: Span,
    },

    #[error("cannot read literal `{text}`")]
    #[diagnostic(code(dpcheck::exec::literal))]
    Literal {
        text: String,
        #[label]
        span: Span,
    },

    #[error("stopped after {limit} steps")]
    #[diagnostic(code(dpcheck::exec::step_limit))]
    StepLimit { limit: usize },
}

/// Internal control flow of a derivation.
#[derive(Debug)]
pub(crate) enum Halt {
    Dead(DeadEnd),
    Fatal(VerifyError),
}

impl From<DeadEnd> for Halt {
    fn from(e: DeadEnd) -> Self {
        Halt::Dead(e)
    }
}

impl From<VerifyError> for Halt {
    fn from(e: VerifyError) -> Self {
        Halt::Fatal(e)
    }
}
