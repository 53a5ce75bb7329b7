//! Concrete execution of a mechanism with every noise draw fixed at zero.
//!
//! Refuted verdicts are backed by a replay: the program runs on two adjacent
//! query arrays with the same noise in both runs, and the two output
//! sequences are reported when they differ.

use std::collections::BTreeMap;

use dpcheck_ast::{Adjacency, BaseType, BinOp, Block, Expr, ExprKind, Program, Rhs, Stmt, SymbolTable, UnaryOp};
use num_traits::{One, ToPrimitive, Zero};
use tracing::{debug, trace};

use crate::error::ExecError;
use crate::solver::{AssumptionSet, CmpOp};
use crate::sym::{Point, Rational, parse_decimal, rat};
use crate::verdict::Replay;

/// Statements one run may execute before it is abandoned.
pub const STEP_LIMIT: usize = 100_000;

/// Array length used when the witness does not fix one.
const DEFAULT_LENGTH: usize = 5;
const MAX_LENGTH: usize = 16;

enum Flow {
    Normal,
    Break,
}

/// Interpreter state for one run.
pub struct Machine<'a> {
    symbols: &'a SymbolTable,
    query_name: &'a str,
    query: &'a [Rational],
    env: BTreeMap<String, Rational>,
    outputs: Vec<Rational>,
    steps: usize,
    limit: usize,
}

impl<'a> Machine<'a> {
    /// Scalar parameters come from `params`. The length parameter is always
    /// the length of `query`.
    pub fn new(program: &'a Program, symbols: &'a SymbolTable, params: &Point, query: &'a [Rational]) -> Self {
        let mut env = BTreeMap::new();
        for p in program.params.iter().filter(|p| !p.array) {
            if let Some(v) = params.get(&p.name.node) {
                env.insert(p.name.node.clone(), v.clone());
            }
        }
        if let Some(len) = program.length_param() {
            env.insert(len.name.node.clone(), rat(query.len() as i64));
        }
        Self {
            symbols,
            query_name: program.query_param().map_or("", |p| p.name.node.as_str()),
            query,
            env,
            outputs: Vec::new(),
            steps: 0,
            limit: STEP_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Runs `body` and returns the outputs in order.
    pub fn run(mut self, body: &Block) -> Result<Vec<Rational>, ExecError> {
        self.exec_block(body)?;
        Ok(self.outputs)
    }

    fn tick(&mut self) -> Result<(), ExecError> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(ExecError::StepLimit { limit: self.limit });
        }
        Ok(())
    }

    fn exec_block(&mut self, block: &Block) -> Result<Flow, ExecError> {
        for stmt in &block.stmts {
            if let Flow::Break = self.exec(stmt)? {
                return Ok(Flow::Break);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ExecError> {
        self.tick()?;
        match stmt {
            Stmt::Decl(d) => {
                let v = match &d.init {
                    Some(rhs) => self.rhs(rhs)?,
                    None => Rational::zero(),
                };
                self.store(&d.name.node, d.ty, v);
            }
            Stmt::Assign(a) => {
                let v = self.rhs(&a.value)?;
                let ty = self.symbols.get(&a.target.node).map_or(BaseType::Float, |m| m.ty);
                self.store(&a.target.node, ty, v);
            }
            Stmt::If(s) => {
                if self.truth(&s.cond)? {
                    return self.exec_block(&s.then_block);
                }
                if let Some(e) = &s.else_block {
                    return self.exec_block(e);
                }
            }
            Stmt::While(w) => {
                while self.truth(&w.cond)? {
                    self.tick()?;
                    if let Flow::Break = self.exec_block(&w.body)? {
                        break;
                    }
                }
            }
            Stmt::Output(o) => {
                let v = self.eval(&o.expr)?;
                self.outputs.push(v);
            }
            Stmt::Break(_) => return Ok(Flow::Break),
            Stmt::Block(b) => return self.exec_block(b),
        }
        Ok(Flow::Normal)
    }

    fn rhs(&mut self, rhs: &Rhs) -> Result<Rational, ExecError> {
        match rhs {
            Rhs::Expr(e) => self.eval(e),
            // Both runs see the same sample.
            Rhs::Laplace(_) => Ok(Rational::zero()),
        }
    }

    fn store(&mut self, name: &str, ty: BaseType, v: Rational) {
        let v = match ty {
            BaseType::Int => v.trunc(),
            BaseType::Float => v,
        };
        trace!(name, value = %v, "store");
        self.env.insert(name.to_string(), v);
    }

    fn truth(&self, expr: &Expr) -> Result<bool, ExecError> {
        Ok(!self.eval(expr)?.is_zero())
    }

    fn eval(&self, expr: &Expr) -> Result<Rational, ExecError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(n) => Ok(Rational::from_integer((*n).into())),
            ExprKind::Decimal(text) => parse_decimal(text).ok_or_else(|| ExecError::Literal {
                text: text.clone(),
                span,
            }),
            ExprKind::Ident(id) => self.env.get(&id.node).cloned().ok_or_else(|| ExecError::Unbound {
                name: id.node.clone(),
                span,
            }),
            ExprKind::Index { base, index } => {
                if base.node != self.query_name {
                    return Err(ExecError::Unbound {
                        name: base.node.clone(),
                        span,
                    });
                }
                let i = self.eval(index)?;
                let slot = if i.is_integer() { i.to_integer().to_usize() } else { None };
                slot.and_then(|k| self.query.get(k))
                    .cloned()
                    .ok_or_else(|| ExecError::OutOfBounds {
                        index: i.to_string(),
                        len: self.query.len(),
                        span,
                    })
            }
            ExprKind::Unary { op, expr } => {
                let v = self.eval(expr)?;
                Ok(match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => flag(v.is_zero()),
                })
            }
            ExprKind::Binary { left, op, right } => match op {
                BinOp::And => Ok(flag(self.truth(left)? && self.truth(right)?)),
                BinOp::Or => Ok(flag(self.truth(left)? || self.truth(right)?)),
                BinOp::Add => Ok(self.eval(left)? + self.eval(right)?),
                BinOp::Sub => Ok(self.eval(left)? - self.eval(right)?),
                BinOp::Mul => Ok(self.eval(left)? * self.eval(right)?),
                BinOp::Div | BinOp::Mod => {
                    let l = self.eval(left)?;
                    let r = self.eval(right)?;
                    if r.is_zero() {
                        return Err(ExecError::DivisionByZero { span });
                    }
                    let q = &l / &r;
                    Ok(match op {
                        BinOp::Mod => l - r * q.trunc(),
                        _ if self.is_int(left) && self.is_int(right) => q.trunc(),
                        _ => q,
                    })
                }
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                    let l = self.eval(left)?;
                    let r = self.eval(right)?;
                    Ok(flag(CmpOp::from_binop(*op).is_some_and(|c| c.holds(&l, &r))))
                }
            },
        }
    }

    /// C typing of an expression: integer unless a float is involved.
    fn is_int(&self, expr: &Expr) -> bool {
        let declared = |name: &str| self.symbols.get(name).is_some_and(|m| m.ty == BaseType::Int);
        match &expr.kind {
            ExprKind::Int(_) => true,
            ExprKind::Decimal(_) => false,
            ExprKind::Ident(id) => declared(&id.node),
            ExprKind::Index { base, .. } => declared(&base.node),
            ExprKind::Unary { op: UnaryOp::Not, .. } => true,
            ExprKind::Unary { expr, .. } => self.is_int(expr),
            ExprKind::Binary { left, op, right } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    self.is_int(left) && self.is_int(right)
                }
                _ => true,
            },
        }
    }
}

fn flag(b: bool) -> Rational {
    if b { Rational::one() } else { Rational::zero() }
}

fn query_bases(len: usize) -> Vec<Vec<Rational>> {
    vec![
        vec![Rational::zero(); len],
        vec![Rational::one(); len],
        (0..len).map(|k| rat(k as i64)).collect(),
        (0..len).rev().map(|k| rat(k as i64)).collect(),
    ]
}

/// Differences the adjacency model allows, extremes first.
fn neighbour_shifts(adjacency: Adjacency, len: usize) -> Vec<Vec<Rational>> {
    let uniform = |v: i64| vec![rat(v); len];
    let single = |at: usize, v: i64| {
        let mut d = vec![Rational::zero(); len];
        if let Some(slot) = d.get_mut(at) {
            *slot = rat(v);
        }
        d
    };
    let last = len.saturating_sub(1);
    match adjacency {
        Adjacency::AllDiffer => vec![
            uniform(1),
            uniform(-1),
            (0..len).map(|k| rat(if k % 2 == 0 { 1 } else { -1 })).collect(),
        ],
        Adjacency::OneDiffer => vec![single(0, 1), single(0, -1), single(last, 1), single(last, -1)],
        Adjacency::Increasing => vec![uniform(1), single(0, 1)],
        Adjacency::Decreasing => vec![uniform(-1), single(0, -1)],
    }
}

fn show(values: &[Rational]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

/// Looks for two adjacent query arrays whose outputs differ when both runs
/// draw the same noise. Scalar parameters come from `witness` where it fixes
/// them and default to one otherwise. Candidates violating `assumptions` are
/// skipped.
pub fn find_divergence(
    program: &Program,
    symbols: &SymbolTable,
    assumptions: &AssumptionSet,
    witness: &Point,
) -> Option<Replay> {
    let length_name = program.length_param().map(|p| p.name.node.clone());
    let mut lengths = Vec::new();
    if let Some(n) = length_name
        .as_ref()
        .and_then(|name| witness.get(name))
        .filter(|v| v.is_integer())
        .and_then(|v| v.to_integer().to_usize())
        .filter(|n| (1..=MAX_LENGTH).contains(n))
    {
        lengths.push(n);
    }
    if !lengths.contains(&DEFAULT_LENGTH) {
        lengths.push(DEFAULT_LENGTH);
    }

    for len in lengths {
        let mut params = Point::new();
        for p in program.params.iter().skip(1).filter(|p| !p.array) {
            let v = witness.get(&p.name.node).cloned().unwrap_or_else(Rational::one);
            params.insert(p.name.node.clone(), v);
        }
        if let Some(name) = &length_name {
            params.insert(name.clone(), rat(len as i64));
        }
        if !assumptions.holds_at(&params) {
            debug!(len, "replay parameters violate the assumptions");
            continue;
        }
        for base in query_bases(len) {
            for shift in neighbour_shifts(program.adjacency(), len) {
                let other: Vec<Rational> = base.iter().zip(&shift).map(|(a, d)| a + d).collect();
                let run = |q: &[Rational]| Machine::new(program, symbols, &params, q).run(&program.body);
                let (outputs_a, outputs_b) = match (run(&base), run(&other)) {
                    (Ok(a), Ok(b)) => (a, b),
                    (Err(e), _) | (_, Err(e)) => {
                        debug!(len, error = %e, "replay run failed");
                        continue;
                    }
                };
                if outputs_a != outputs_b {
                    return Some(Replay {
                        parameters: params.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
                        query_a: show(&base),
                        query_b: show(&other),
                        outputs_a: show(&outputs_a),
                        outputs_b: show(&outputs_b),
                    });
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(src: &str) -> (Program, SymbolTable) {
        dpcheck_parse::parse_and_validate(src).expect("valid program")
    }

    const HEADER: &str = r#"
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: ONE_DIFFER;";
  "CHECK: epsilon";"#;

    fn program(body: &str) -> (Program, SymbolTable) {
        parsed(&format!("int m(float q[], int size, float epsilon)\n{{{HEADER}\n{body}\n}}"))
    }

    fn outputs(body: &str, query: &[i64]) -> Result<Vec<Rational>, ExecError> {
        let (p, s) = program(body);
        let q: Vec<Rational> = query.iter().map(|&v| rat(v)).collect();
        let params = Point::from([("epsilon".to_string(), rat(1))]);
        Machine::new(&p, &s, &params, &q).run(&p.body)
    }

    #[test]
    fn loops_and_breaks_follow_c_semantics() {
        let body = r#"
  int i = 0;
  float sum = 0;
  while (i < size)
  {
    sum = sum + q[i];
    if (sum > 4) { break; }
    i = i + 1;
  }
  CHECKDP_OUTPUT(sum);
  CHECKDP_OUTPUT(i);"#;
        assert_eq!(outputs(body, &[1, 2, 3, 4]).unwrap(), vec![rat(6), rat(2)]);
        assert_eq!(outputs(body, &[1, 1]).unwrap(), vec![rat(2), rat(2)]);
    }

    #[test]
    fn integer_variables_truncate() {
        let body = r#"
  int half = 7 / 2;
  int down = 0;
  down = 5 / 2;
  float exact = 7.0 / 2;
  CHECKDP_OUTPUT(half);
  CHECKDP_OUTPUT(down);
  CHECKDP_OUTPUT(exact);
  CHECKDP_OUTPUT(7 % 3);"#;
        let out = outputs(body, &[0]).unwrap();
        assert_eq!(out[0], rat(3));
        assert_eq!(out[1], rat(2));
        assert_eq!(out[2], crate::sym::ratio(7, 2));
        assert_eq!(out[3], rat(1));
    }

    #[test]
    fn noise_draws_are_zero() {
        let body = r#"
  float eta = Lap(1 / epsilon);
  CHECKDP_OUTPUT(q[0] + eta);"#;
        assert_eq!(outputs(body, &[3]).unwrap(), vec![rat(3)]);
    }

    #[test]
    fn runaway_loops_hit_the_step_limit() {
        let (p, s) = program("  int i = 0;\n  while (i >= 0) { i = i + 1; }");
        let q = vec![rat(0)];
        let err = Machine::new(&p, &s, &Point::new(), &q).with_limit(50).run(&p.body).unwrap_err();
        assert!(matches!(err, ExecError::StepLimit { limit: 50 }));
    }

    #[test]
    fn reading_past_the_array_is_an_error() {
        let err = outputs("  CHECKDP_OUTPUT(q[3]);", &[1]).unwrap_err();
        assert!(matches!(err, ExecError::OutOfBounds { len: 1, .. }));
    }

    #[test]
    fn a_data_dependent_branch_has_a_replay() {
        let (p, s) = program("  if (q[0] > 0) { CHECKDP_OUTPUT(1); } else { CHECKDP_OUTPUT(0); }");
        let assumptions = AssumptionSet::from_program(&p, &s).expect("assumptions");
        let replay = find_divergence(&p, &s, &assumptions, &Point::new()).expect("outputs differ");
        assert_ne!(replay.outputs_a, replay.outputs_b);
        assert_eq!(replay.query_a.len(), DEFAULT_LENGTH);
        assert_eq!(replay.parameters.get("size").map(String::as_str), Some("5"));
    }

    #[test]
    fn data_independent_outputs_have_no_replay() {
        let (p, s) = program("  float eta = Lap(1 / epsilon);\n  CHECKDP_OUTPUT(eta);");
        let assumptions = AssumptionSet::from_program(&p, &s).expect("assumptions");
        assert!(find_divergence(&p, &s, &assumptions, &Point::new()).is_none());
    }
}
