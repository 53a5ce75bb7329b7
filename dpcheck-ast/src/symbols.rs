#![allow(unused_assignments)]

use std::collections::BTreeMap;

use miette::Diagnostic;
use thiserror::Error;

use crate::{
    BaseType, BinOp, Block, Expr, ExprKind, Program, Rhs, Span, Stmt, TypeDecl, UnaryOp,
};

#[derive(Debug, Error, Diagnostic)]
#[error("malformed program: {message}")]
#[diagnostic(code(dpcheck::model))]
#[allow(unused_assignments)]
pub struct MalformedProgramError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    Param,
    Local,
    /// A local that receives a `Lap(..)` draw somewhere.
    Noise,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarMeta {
    pub name: String,
    pub ty: BaseType,
    pub array: bool,
    pub kind: VarKind,
    /// TYPES entry; only parameters carry one.
    pub tag: Option<TypeDecl>,
    pub span: Span,
}

/// Flat, function-wide variable namespace of a validated program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymbolTable {
    vars: BTreeMap<String, VarMeta>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<&VarMeta> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VarMeta> {
        self.vars.values()
    }

    pub fn is_param(&self, name: &str) -> bool {
        self.get(name).is_some_and(|m| m.kind == VarKind::Param)
    }

    pub fn is_noise(&self, name: &str) -> bool {
        self.get(name).is_some_and(|m| m.kind == VarKind::Noise)
    }

    pub fn params(&self) -> impl Iterator<Item = &VarMeta> {
        self.vars.values().filter(|m| m.kind == VarKind::Param)
    }
}

/// Structural checks run once before verification.
pub fn validate(program: &Program) -> Result<SymbolTable, MalformedProgramError> {
    let mut table = SymbolTable::default();

    if program.params.len() < 3 {
        return Err(MalformedProgramError {
            message: "expected at least three parameters: a query array, its length and a privacy budget"
                .to_string(),
            span: program.name.span,
        });
    }
    for (idx, p) in program.params.iter().enumerate() {
        if idx == 0 && !p.array {
            return Err(MalformedProgramError {
                message: format!("first parameter `{}` must be the query array", p.name.node),
                span: p.span,
            });
        }
        if idx == 1 && (p.array || p.ty != BaseType::Int) {
            return Err(MalformedProgramError {
                message: format!("second parameter `{}` must be the int length of the query array", p.name.node),
                span: p.span,
            });
        }
        let Some(tag) = program.annotations.type_of(&p.name.node) else {
            return Err(MalformedProgramError {
                message: format!("parameter `{}` has no TYPES entry", p.name.node),
                span: p.span,
            });
        };
        let meta = VarMeta {
            name: p.name.node.clone(),
            ty: p.ty,
            array: p.array,
            kind: VarKind::Param,
            tag: Some(tag.clone()),
            span: p.span,
        };
        if table.vars.insert(p.name.node.clone(), meta).is_some() {
            return Err(MalformedProgramError {
                message: format!("duplicate parameter `{}`", p.name.node),
                span: p.name.span,
            });
        }
    }
    for decl in &program.annotations.types {
        if !table.is_param(&decl.name.node) {
            return Err(MalformedProgramError {
                message: format!("TYPES entry `{}` does not name a parameter", decl.name.node),
                span: decl.name.span,
            });
        }
    }

    for expr in &program.annotations.precondition.assumptions {
        check_param_only(&table, expr, "assumptions")?;
    }
    check_param_only(&table, &program.annotations.check, "the CHECK budget")?;

    let mut v = Validator { table, loop_depth: 0 };
    v.block(&program.body)?;
    Ok(v.table)
}

fn check_param_only(table: &SymbolTable, expr: &Expr, what: &str) -> Result<(), MalformedProgramError> {
    for id in expr.idents() {
        match table.get(&id.node) {
            Some(m) if m.kind == VarKind::Param && !m.array => {}
            Some(_) => {
                return Err(MalformedProgramError {
                    message: format!("{what} may only mention scalar parameters, found `{}`", id.node),
                    span: id.span,
                });
            }
            None => {
                return Err(MalformedProgramError {
                    message: format!("undeclared variable `{}`", id.node),
                    span: id.span,
                });
            }
        }
    }
    Ok(())
}

struct Validator {
    table: SymbolTable,
    loop_depth: usize,
}

impl Validator {
    fn block(&mut self, block: &Block) -> Result<(), MalformedProgramError> {
        let mut after_break = false;
        for stmt in &block.stmts {
            if after_break {
                if let Some(span) = first_output(stmt) {
                    return Err(unreachable_output(span));
                }
            }
            self.stmt(stmt)?;
            if matches!(stmt, Stmt::Break(_)) {
                after_break = true;
            }
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), MalformedProgramError> {
        match stmt {
            Stmt::Decl(d) => {
                if let Some(init) = &d.init {
                    self.rhs(init)?;
                }
                let kind = match &d.init {
                    Some(Rhs::Laplace(_)) => VarKind::Noise,
                    _ => VarKind::Local,
                };
                match self.table.vars.get_mut(&d.name.node) {
                    Some(m) if m.kind == VarKind::Param => {
                        return Err(MalformedProgramError {
                            message: format!("local `{}` shadows a parameter", d.name.node),
                            span: d.name.span,
                        });
                    }
                    Some(m) if m.ty != d.ty => {
                        return Err(MalformedProgramError {
                            message: format!(
                                "`{}` is redeclared as {} but was declared {}",
                                d.name.node, d.ty, m.ty
                            ),
                            span: d.name.span,
                        });
                    }
                    Some(m) => {
                        if kind == VarKind::Noise {
                            m.kind = VarKind::Noise;
                        }
                    }
                    None => {
                        self.table.vars.insert(
                            d.name.node.clone(),
                            VarMeta {
                                name: d.name.node.clone(),
                                ty: d.ty,
                                array: false,
                                kind,
                                tag: None,
                                span: d.span,
                            },
                        );
                    }
                }
                Ok(())
            }
            Stmt::Assign(a) => {
                self.rhs(&a.value)?;
                match self.table.vars.get_mut(&a.target.node) {
                    None => Err(undeclared(&a.target.node, a.target.span)),
                    Some(m) if m.kind == VarKind::Param => Err(MalformedProgramError {
                        message: format!("parameter `{}` cannot be assigned", a.target.node),
                        span: a.target.span,
                    }),
                    Some(m) => {
                        if matches!(a.value, Rhs::Laplace(_)) {
                            m.kind = VarKind::Noise;
                        }
                        Ok(())
                    }
                }
            }
            Stmt::If(s) => {
                self.expr(&s.cond)?;
                match const_truth(&s.cond) {
                    Some(false) => {
                        if let Some(span) = first_output_in(&s.then_block) {
                            return Err(unreachable_output(span));
                        }
                    }
                    Some(true) => {
                        if let Some(span) = s.else_block.as_ref().and_then(first_output_in) {
                            return Err(unreachable_output(span));
                        }
                    }
                    None => {}
                }
                self.block(&s.then_block)?;
                if let Some(else_block) = &s.else_block {
                    self.block(else_block)?;
                }
                Ok(())
            }
            Stmt::While(s) => {
                self.expr(&s.cond)?;
                if const_truth(&s.cond) == Some(false) {
                    if let Some(span) = first_output_in(&s.body) {
                        return Err(unreachable_output(span));
                    }
                }
                self.loop_depth += 1;
                let res = self.block(&s.body);
                self.loop_depth -= 1;
                res
            }
            Stmt::Output(o) => self.expr(&o.expr),
            Stmt::Break(b) => {
                if self.loop_depth == 0 {
                    return Err(MalformedProgramError {
                        message: "`break` outside of a loop".to_string(),
                        span: b.span,
                    });
                }
                Ok(())
            }
            Stmt::Block(b) => self.block(b),
        }
    }

    fn rhs(&self, rhs: &Rhs) -> Result<(), MalformedProgramError> {
        match rhs {
            Rhs::Expr(e) => self.expr(e),
            Rhs::Laplace(lap) => {
                self.expr(&lap.scale)?;
                check_param_only(&self.table, &lap.scale, "a Laplace scale")
            }
        }
    }

    fn expr(&self, expr: &Expr) -> Result<(), MalformedProgramError> {
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Decimal(_) => Ok(()),
            ExprKind::Ident(id) => match self.table.get(&id.node) {
                None => Err(undeclared(&id.node, id.span)),
                Some(m) if m.array => Err(MalformedProgramError {
                    message: format!("array `{}` used without an index", id.node),
                    span: id.span,
                }),
                Some(_) => Ok(()),
            },
            ExprKind::Index { base, index } => {
                match self.table.get(&base.node) {
                    None => return Err(undeclared(&base.node, base.span)),
                    Some(m) if !m.array => {
                        return Err(MalformedProgramError {
                            message: format!("`{}` is not an array", base.node),
                            span: base.span,
                        });
                    }
                    Some(_) => {}
                }
                self.expr(index)
            }
            ExprKind::Unary { expr, .. } => self.expr(expr),
            ExprKind::Binary { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
        }
    }
}

fn undeclared(name: &str, span: Span) -> MalformedProgramError {
    MalformedProgramError {
        message: format!("undeclared variable `{name}`"),
        span,
    }
}

fn unreachable_output(span: Span) -> MalformedProgramError {
    MalformedProgramError {
        message: "output statement can never be reached".to_string(),
        span,
    }
}

fn first_output(stmt: &Stmt) -> Option<Span> {
    match stmt {
        Stmt::Output(o) => Some(o.span),
        Stmt::If(s) => first_output_in(&s.then_block)
            .or_else(|| s.else_block.as_ref().and_then(first_output_in)),
        Stmt::While(s) => first_output_in(&s.body),
        Stmt::Block(b) => first_output_in(b),
        _ => None,
    }
}

fn first_output_in(block: &Block) -> Option<Span> {
    block.stmts.iter().find_map(first_output)
}

/// Truth value of a condition built only from literals, if it has one.
pub fn const_truth(expr: &Expr) -> Option<bool> {
    match &expr.kind {
        ExprKind::Int(n) => Some(*n != 0),
        ExprKind::Unary {
            op: UnaryOp::Not,
            expr,
        } => const_truth(expr).map(|b| !b),
        ExprKind::Binary { left, op, right } => match op {
            BinOp::And => match (const_truth(left), const_truth(right)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            BinOp::Or => match (const_truth(left), const_truth(right)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            op if op.is_comparison() => {
                let (ExprKind::Int(a), ExprKind::Int(b)) = (&left.kind, &right.kind) else {
                    return None;
                };
                Some(match op {
                    BinOp::Eq => a == b,
                    BinOp::Ne => a != b,
                    BinOp::Lt => a < b,
                    BinOp::Gt => a > b,
                    BinOp::Le => a <= b,
                    _ => a >= b,
                })
            }
            _ => None,
        },
        _ => None,
    }
}
