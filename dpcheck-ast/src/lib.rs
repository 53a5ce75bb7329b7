#![forbid(unsafe_code)]

mod symbols;
mod walk;

use std::fmt;

use miette::SourceSpan;

pub use symbols::{MalformedProgramError, SymbolTable, VarKind, VarMeta, const_truth, validate};
pub use walk::StmtWalk;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

/// One annotated mechanism: a single function with its TYPES, PRECONDITION
/// and CHECK annotations.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub span: Span,
    /// `None` for `void`.
    pub ret: Option<BaseType>,
    pub name: Ident,
    pub params: Vec<Param>,
    pub annotations: Annotations,
    pub body: Block,
}

impl Program {
    /// Pre-order walk over every statement. Calling `walk` again restarts it.
    pub fn walk(&self) -> StmtWalk<'_> {
        StmtWalk::new(&self.body)
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name.node == name)
    }

    /// The query array is the first parameter.
    pub fn query_param(&self) -> Option<&Param> {
        self.params.first()
    }

    /// The length of the query array is the second parameter.
    pub fn length_param(&self) -> Option<&Param> {
        self.params.get(1)
    }

    pub fn adjacency(&self) -> Adjacency {
        self.annotations.precondition.adjacency.node
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub span: Span,
    pub ty: BaseType,
    pub name: Ident,
    pub array: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaseType {
    Int,
    Float,
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseType::Int => f.write_str("int"),
            BaseType::Float => f.write_str("float"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotations {
    pub types: Vec<TypeDecl>,
    pub precondition: Precondition,
    pub check: Expr,
}

impl Annotations {
    pub fn type_of(&self, name: &str) -> Option<&TypeDecl> {
        self.types.iter().find(|t| t.name.node == name)
    }
}

/// `name: <lo, hi>` from the TYPES annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDecl {
    pub span: Span,
    pub name: Ident,
    pub lo: TagBound,
    pub hi: TagBound,
}

impl TypeDecl {
    /// `<0, 0>`: the value is identical in both runs.
    pub fn is_fixed(&self) -> bool {
        self.lo == TagBound::Zero && self.hi == TagBound::Zero
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagBound {
    Zero,
    /// Determined by the adjacency relation.
    Star,
}

impl fmt::Display for TagBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagBound::Zero => f.write_str("0"),
            TagBound::Star => f.write_str("*"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Precondition {
    pub span: Span,
    pub adjacency: Spanned<Adjacency>,
    pub assumptions: Vec<Expr>,
}

/// How two neighboring query arrays may differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Adjacency {
    /// Every entry may differ by at most one.
    AllDiffer,
    /// At most one entry differs, by at most one.
    OneDiffer,
    /// Every entry may grow by at most one.
    Increasing,
    /// Every entry may shrink by at most one.
    Decreasing,
}

impl Adjacency {
    pub fn keyword(self) -> &'static str {
        match self {
            Adjacency::AllDiffer => "ALL_DIFFER",
            Adjacency::OneDiffer => "ONE_DIFFER",
            Adjacency::Increasing => "INCREASING",
            Adjacency::Decreasing => "DECREASING",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "ALL_DIFFER" => Some(Adjacency::AllDiffer),
            "ONE_DIFFER" => Some(Adjacency::OneDiffer),
            "INCREASING" => Some(Adjacency::Increasing),
            "DECREASING" => Some(Adjacency::Decreasing),
            _ => None,
        }
    }
}

impl fmt::Display for Adjacency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Decl(DeclStmt),
    Assign(AssignStmt),
    If(IfStmt),
    While(WhileStmt),
    Output(OutputStmt),
    Break(BreakStmt),
    Block(Block),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Decl(s) => s.span,
            Stmt::Assign(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::Output(s) => s.span,
            Stmt::Break(s) => s.span,
            Stmt::Block(b) => b.span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeclStmt {
    pub span: Span,
    pub ty: BaseType,
    pub name: Ident,
    pub init: Option<Rhs>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Ident,
    pub value: Rhs,
}

/// Right-hand side of a declaration or assignment.
#[derive(Clone, Debug, PartialEq)]
pub enum Rhs {
    Expr(Expr),
    Laplace(LaplaceDraw),
}

/// `Lap(scale)`: a draw from the Laplace distribution centred at zero.
#[derive(Clone, Debug, PartialEq)]
pub struct LaplaceDraw {
    pub span: Span,
    pub scale: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub cond: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub cond: Expr,
    pub body: Block,
}

/// `CHECKDP_OUTPUT(expr)`
#[derive(Clone, Debug, PartialEq)]
pub struct OutputStmt {
    pub span: Span,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BreakStmt {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

impl Expr {
    /// Calls `f` on every identifier the expression reads, including array bases.
    pub fn visit_idents<'a>(&'a self, f: &mut impl FnMut(&'a Ident)) {
        match &self.kind {
            ExprKind::Int(_) | ExprKind::Decimal(_) => {}
            ExprKind::Ident(id) => f(id),
            ExprKind::Index { base, index } => {
                f(base);
                index.visit_idents(f);
            }
            ExprKind::Unary { expr, .. } => expr.visit_idents(f),
            ExprKind::Binary { left, right, .. } => {
                left.visit_idents(f);
                right.visit_idents(f);
            }
        }
    }

    pub fn mentions(&self, name: &str) -> bool {
        let mut found = false;
        self.visit_idents(&mut |id| found |= id.node == name);
        found
    }

    pub fn idents(&self) -> Vec<&Ident> {
        let mut out = Vec::new();
        self.visit_idents(&mut |id| out.push(id));
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Int(u64),
    /// Decimal literal kept as written so it can be read back exactly.
    Decimal(String),
    Ident(Ident),
    Index {
        base: Ident,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}
