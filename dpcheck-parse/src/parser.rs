#![forbid(unsafe_code)]

use std::mem;

use dpcheck_ast::{
    Adjacency, Annotations, AssignStmt, BaseType, BinOp, Block, BreakStmt, DeclStmt, Expr,
    ExprKind, Ident, IfStmt, LaplaceDraw, OutputStmt, Param, Precondition, Program, Rhs, Span,
    Spanned, Stmt, TagBound, TypeDecl, UnaryOp, WhileStmt, span_between,
};
use dpcheck_lex::{Lexer, Token, TokenKind};

use crate::error::ParseError;

pub const OUTPUT_FN: &str = "CHECKDP_OUTPUT";
pub const LAPLACE_FN: &str = "Lap";

pub struct Parser<'a> {
    tokens: &'a [Token],
    idx: usize,
}

/// The three annotation strings, as they are collected while parsing the body.
#[derive(Default)]
struct PendingAnnotations {
    types: Option<Vec<TypeDecl>>,
    precondition: Option<Precondition>,
    check: Option<Expr>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, idx: 0 }
    }

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let start = self.peek_span().unwrap_or_else(|| span_between(0, 0));
        let ret = match self.peek_kind() {
            Some(TokenKind::KwVoid) => {
                self.next();
                None
            }
            _ => Some(self.parse_base_type()?),
        };
        let name = self.expect_ident()?;

        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                params.push(self.parse_param()?);
                if self.at(TokenKind::Comma) {
                    self.next();
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        let lbrace = self.expect(TokenKind::LBrace)?;
        let mut pending = PendingAnnotations::default();
        while let Some(TokenKind::String(_)) = self.peek_kind() {
            self.parse_annotation(&mut pending)?;
        }
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            self.parse_stmt_into(&mut stmts)?;
        }
        let rbrace = self.expect(TokenKind::RBrace)?;
        let eof_span = self.peek_span().unwrap_or(rbrace.span);
        if !self.at(TokenKind::Eof) {
            return Err(ParseError {
                message: "expected end of file after the function body".to_string(),
                span: eof_span,
            });
        }

        let body_span = join(lbrace.span, rbrace.span);
        let annotations = finish_annotations(pending, lbrace.span)?;
        Ok(Program {
            span: join(start, rbrace.span),
            ret,
            name,
            params,
            annotations,
            body: Block {
                span: body_span,
                stmts,
            },
        })
    }

    pub fn parse_expr_eof(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if !self.at(TokenKind::Eof) {
            return Err(ParseError {
                message: "unexpected trailing tokens".to_string(),
                span: self.peek_span().unwrap_or(expr.span),
            });
        }
        Ok(expr)
    }

    fn parse_base_type(&mut self) -> Result<BaseType, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::KwInt => Ok(BaseType::Int),
            TokenKind::KwFloat => Ok(BaseType::Float),
            _ => Err(ParseError {
                message: "expected `int` or `float`".to_string(),
                span: tok.span,
            }),
        }
    }

    fn parse_param(&mut self) -> Result<Param, ParseError> {
        let start = self.peek_span().unwrap_or_else(|| span_between(0, 0));
        let ty = self.parse_base_type()?;
        let name = self.expect_ident()?;
        let mut end = name.span;
        let mut array = false;
        if self.at(TokenKind::LBracket) {
            self.next();
            end = self.expect(TokenKind::RBracket)?.span;
            array = true;
        }
        Ok(Param {
            span: join(start, end),
            ty,
            name,
            array,
        })
    }

    // ---------------------------------------------------------------------
    // Annotations
    // ---------------------------------------------------------------------

    fn parse_annotation(&mut self, pending: &mut PendingAnnotations) -> Result<(), ParseError> {
        let tok = self.expect_any()?;
        let TokenKind::String(text) = &tok.kind else {
            return Err(ParseError {
                message: "expected an annotation string".to_string(),
                span: tok.span,
            });
        };
        self.expect(TokenKind::Semi)?;

        // Contents start one byte after the opening quote.
        let content_start = usize::from(tok.span.offset()) + 1;
        let trimmed = text.trim_start();
        let lead = text.len() - trimmed.len();

        let (keyword, rest) = match trimmed.split_once(':') {
            Some((k, r)) => (k.trim_end(), r),
            None => ("", trimmed),
        };
        let rest_offset = content_start + lead + (trimmed.len() - rest.len());
        let tokens = Lexer::with_offset(rest, rest_offset)
            .lex()
            .map_err(|e| ParseError {
                message: e.message,
                span: e.span,
            })?;
        let mut sub = Parser::new(&tokens);

        match keyword {
            "TYPES" => {
                if pending.types.is_some() {
                    return Err(duplicate_annotation("TYPES", tok.span));
                }
                pending.types = Some(sub.parse_types_annotation()?);
            }
            "PRECONDITION" => {
                if pending.precondition.is_some() {
                    return Err(duplicate_annotation("PRECONDITION", tok.span));
                }
                pending.precondition = Some(sub.parse_precondition_annotation(tok.span)?);
            }
            "CHECK" => {
                if pending.check.is_some() {
                    return Err(duplicate_annotation("CHECK", tok.span));
                }
                pending.check = Some(sub.parse_expr_eof()?);
            }
            _ => {
                return Err(ParseError {
                    message: "annotation must start with `TYPES:`, `PRECONDITION:` or `CHECK:`"
                        .to_string(),
                    span: tok.span,
                });
            }
        }
        Ok(())
    }

    /// `name: <lo, hi>; ...` where each bound is `0` or `*`.
    fn parse_types_annotation(&mut self) -> Result<Vec<TypeDecl>, ParseError> {
        let mut decls = Vec::new();
        while !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Semi) {
                self.next();
                continue;
            }
            let name = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            self.expect(TokenKind::Lt)?;
            let lo = self.parse_tag_bound()?;
            self.expect(TokenKind::Comma)?;
            let hi = self.parse_tag_bound()?;
            let end = self.expect(TokenKind::Gt)?.span;
            if decls.iter().any(|d: &TypeDecl| d.name.node == name.node) {
                return Err(ParseError {
                    message: format!("`{}` appears twice in TYPES", name.node),
                    span: name.span,
                });
            }
            decls.push(TypeDecl {
                span: join(name.span, end),
                name,
                lo,
                hi,
            });
            if !self.at(TokenKind::Eof) {
                self.expect(TokenKind::Semi)?;
            }
        }
        Ok(decls)
    }

    fn parse_tag_bound(&mut self) -> Result<TagBound, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Int(0) => Ok(TagBound::Zero),
            TokenKind::Star => Ok(TagBound::Star),
            _ => Err(ParseError {
                message: "distance bound must be `0` or `*`".to_string(),
                span: tok.span,
            }),
        }
    }

    /// `ADJACENCY; ASSUME(expr); ...`
    fn parse_precondition_annotation(&mut self, whole: Span) -> Result<Precondition, ParseError> {
        let adj = self.expect_ident()?;
        let Some(adjacency) = Adjacency::from_keyword(&adj.node) else {
            return Err(ParseError {
                message: format!(
                    "unknown adjacency `{}`; expected ALL_DIFFER, ONE_DIFFER, INCREASING or DECREASING",
                    adj.node
                ),
                span: adj.span,
            });
        };
        let mut assumptions = Vec::new();
        while !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Semi) {
                self.next();
                continue;
            }
            let kw = self.expect_ident()?;
            if kw.node != "ASSUME" {
                return Err(ParseError {
                    message: format!("expected `ASSUME(..)`, found `{}`", kw.node),
                    span: kw.span,
                });
            }
            self.expect(TokenKind::LParen)?;
            assumptions.push(self.parse_expr()?);
            self.expect(TokenKind::RParen)?;
        }
        Ok(Precondition {
            span: whole,
            adjacency: Spanned::new(adj.span, adjacency),
            assumptions,
        })
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn parse_stmt_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let span = self.peek_span().unwrap_or_else(|| span_between(0, 0));
        match self.peek_kind() {
            Some(TokenKind::KwInt | TokenKind::KwFloat) => self.parse_decls(out),
            Some(TokenKind::KwIf) => {
                let s = self.parse_if()?;
                out.push(s);
                Ok(())
            }
            Some(TokenKind::KwWhile) => {
                let s = self.parse_while()?;
                out.push(s);
                Ok(())
            }
            Some(TokenKind::KwBreak) => {
                self.next();
                let semi = self.expect(TokenKind::Semi)?;
                out.push(Stmt::Break(BreakStmt {
                    span: join(span, semi.span),
                }));
                Ok(())
            }
            Some(TokenKind::KwReturn) => Err(ParseError {
                message: format!("`return` is not supported; report results with `{OUTPUT_FN}(..)`"),
                span,
            }),
            Some(TokenKind::LBrace) => {
                let b = self.parse_brace_block()?;
                out.push(Stmt::Block(b));
                Ok(())
            }
            Some(TokenKind::Semi) => {
                self.next();
                Ok(())
            }
            Some(TokenKind::Ident(_)) => {
                let s = self.parse_ident_stmt()?;
                out.push(s);
                Ok(())
            }
            _ => Err(ParseError {
                message: "expected a statement".to_string(),
                span,
            }),
        }
    }

    /// `int a = 1, b;` becomes one declaration per name.
    fn parse_decls(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let start = self.peek_span().unwrap_or_else(|| span_between(0, 0));
        let ty = self.parse_base_type()?;
        loop {
            let name = self.expect_ident()?;
            if self.at(TokenKind::LBracket) {
                return Err(ParseError {
                    message: "local arrays are not supported".to_string(),
                    span: name.span,
                });
            }
            let mut end = name.span;
            let init = if self.at(TokenKind::Eq) {
                self.next();
                let rhs = self.parse_rhs()?;
                end = rhs_span(&rhs);
                Some(rhs)
            } else {
                None
            };
            out.push(Stmt::Decl(DeclStmt {
                span: join(start, end),
                ty,
                name,
                init,
            }));
            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        self.expect(TokenKind::Semi)?;
        Ok(())
    }

    fn parse_ident_stmt(&mut self) -> Result<Stmt, ParseError> {
        let name = self.expect_ident()?;
        if self.at(TokenKind::LParen) {
            if name.node != OUTPUT_FN {
                return Err(ParseError {
                    message: format!("unknown function `{}`; only `{OUTPUT_FN}` may be called here", name.node),
                    span: name.span,
                });
            }
            self.next();
            let expr = self.parse_expr()?;
            self.expect(TokenKind::RParen)?;
            let semi = self.expect(TokenKind::Semi)?;
            return Ok(Stmt::Output(OutputStmt {
                span: join(name.span, semi.span),
                expr,
            }));
        }
        if self.at(TokenKind::LBracket) {
            return Err(ParseError {
                message: "array elements cannot be assigned".to_string(),
                span: name.span,
            });
        }
        self.expect(TokenKind::Eq)?;
        let value = self.parse_rhs()?;
        let semi = self.expect(TokenKind::Semi)?;
        Ok(Stmt::Assign(AssignStmt {
            span: join(name.span, semi.span),
            target: name,
            value,
        }))
    }

    fn parse_rhs(&mut self) -> Result<Rhs, ParseError> {
        let is_lap = matches!(self.peek_kind(), Some(TokenKind::Ident(n)) if n == LAPLACE_FN)
            && matches!(self.peek_kind_n(1), Some(TokenKind::LParen));
        if !is_lap {
            return Ok(Rhs::Expr(self.parse_expr()?));
        }
        let kw = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let scale = self.parse_expr()?;
        let close = self.expect(TokenKind::RParen)?;
        Ok(Rhs::Laplace(LaplaceDraw {
            span: join(kw.span, close.span),
            scale,
        }))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwIf)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let then_block = self.parse_body()?;
        let mut end = then_block.span;
        let else_block = if self.at(TokenKind::KwElse) {
            self.next();
            let b = self.parse_body()?;
            end = b.span;
            Some(b)
        } else {
            None
        };
        Ok(Stmt::If(IfStmt {
            span: join(kw.span, end),
            cond,
            then_block,
            else_block,
        }))
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwWhile)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let body = self.parse_body()?;
        Ok(Stmt::While(WhileStmt {
            span: join(kw.span, body.span),
            cond,
            body,
        }))
    }

    /// A braced block, or a single statement wrapped in a block.
    fn parse_body(&mut self) -> Result<Block, ParseError> {
        if self.at(TokenKind::LBrace) {
            return self.parse_brace_block();
        }
        let start = self.peek_span().unwrap_or_else(|| span_between(0, 0));
        let mut stmts = Vec::new();
        self.parse_stmt_into(&mut stmts)?;
        let span = stmts
            .iter()
            .map(Stmt::span)
            .reduce(join)
            .unwrap_or(start);
        Ok(Block { span, stmts })
    }

    fn parse_brace_block(&mut self) -> Result<Block, ParseError> {
        let open = self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(ParseError {
                    message: "unclosed `{`".to_string(),
                    span: open.span,
                });
            }
            self.parse_stmt_into(&mut stmts)?;
        }
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Block {
            span: join(open.span, close.span),
            stmts,
        })
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and_expr()?;
        while self.at(TokenKind::OrOr) {
            self.next();
            let right = self.parse_and_expr()?;
            left = binary(left, BinOp::Or, right);
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_cmp_expr()?;
        while self.at(TokenKind::AndAnd) {
            self.next();
            let right = self.parse_cmp_expr()?;
            left = binary(left, BinOp::And, right);
        }
        Ok(left)
    }

    fn parse_cmp_expr(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_add_expr()?;
        let Some(op) = self.peek_cmp_op() else {
            return Ok(left);
        };
        self.next();
        let right = self.parse_add_expr()?;
        let expr = binary(left, op, right);

        // `a < b < c` means something different in C than it reads; require parentheses.
        if self.peek_cmp_op().is_some() {
            let span = self.peek_span().unwrap_or(expr.span);
            return Err(ParseError {
                message: "chained comparisons are not supported; use parentheses or `&&`".to_string(),
                span,
            });
        }
        Ok(expr)
    }

    fn peek_cmp_op(&self) -> Option<BinOp> {
        match self.peek_kind() {
            Some(TokenKind::EqEq) => Some(BinOp::Eq),
            Some(TokenKind::Neq) => Some(BinOp::Ne),
            Some(TokenKind::Lt) => Some(BinOp::Lt),
            Some(TokenKind::Gt) => Some(BinOp::Gt),
            Some(TokenKind::Le) => Some(BinOp::Le),
            Some(TokenKind::Ge) => Some(BinOp::Ge),
            _ => None,
        }
    }

    fn parse_add_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mul_expr()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_mul_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_mul_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            self.next();
            let right = self.parse_unary_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Bang) => UnaryOp::Not,
            _ => return self.parse_primary_expr(),
        };
        let tok = self.expect_any()?;
        let expr = self.parse_unary_expr()?;
        Ok(Expr {
            span: join(tok.span, expr.span),
            kind: ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
        })
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Int(n) => Ok(Expr {
                span: tok.span,
                kind: ExprKind::Int(n),
            }),
            TokenKind::Decimal(s) => Ok(Expr {
                span: tok.span,
                kind: ExprKind::Decimal(s),
            }),
            TokenKind::Ident(name) => {
                let ident = Ident {
                    span: tok.span,
                    node: name,
                };
                if self.at(TokenKind::LParen) {
                    let message = if ident.node == LAPLACE_FN {
                        format!("`{LAPLACE_FN}(..)` must be the whole right-hand side of an assignment")
                    } else {
                        format!("function calls are not supported (`{}`)", ident.node)
                    };
                    return Err(ParseError {
                        message,
                        span: ident.span,
                    });
                }
                if self.at(TokenKind::LBracket) {
                    self.next();
                    let index = self.parse_expr()?;
                    let close = self.expect(TokenKind::RBracket)?;
                    return Ok(Expr {
                        span: join(ident.span, close.span),
                        kind: ExprKind::Index {
                            base: ident,
                            index: Box::new(index),
                        },
                    });
                }
                Ok(Expr {
                    span: tok.span,
                    kind: ExprKind::Ident(ident),
                })
            }
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                let close = self.expect(TokenKind::RParen)?;
                Ok(Expr {
                    span: join(tok.span, close.span),
                    kind: inner.kind,
                })
            }
            _ => Err(ParseError {
                message: "expected an expression".to_string(),
                span: tok.span,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Token helpers
    // ---------------------------------------------------------------------

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Ident(name) => Ok(Ident {
                span: tok.span,
                node: name,
            }),
            _ => Err(ParseError {
                message: "expected identifier".to_string(),
                span: tok.span,
            }),
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token, ParseError> {
        let tok = self.expect_any()?;
        if mem::discriminant(&tok.kind) == mem::discriminant(&expected) {
            Ok(tok)
        } else {
            Err(ParseError {
                message: format!("expected {}", describe(&expected)),
                span: tok.span,
            })
        }
    }

    fn expect_any(&mut self) -> Result<Token, ParseError> {
        let fallback = self
            .tokens
            .last()
            .map(|t| t.span)
            .unwrap_or_else(|| span_between(0, 0));
        self.next().ok_or(ParseError {
            message: "unexpected end of input".to_string(),
            span: fallback,
        })
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind()
            .is_some_and(|k| mem::discriminant(k) == mem::discriminant(&kind))
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.idx)?.clone();
        self.idx += 1;
        Some(tok)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.idx).map(|t| &t.kind)
    }

    fn peek_kind_n(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.idx + n).map(|t| &t.kind)
    }

    fn peek_span(&self) -> Option<Span> {
        self.tokens.get(self.idx).map(|t| t.span)
    }
}

fn finish_annotations(pending: PendingAnnotations, at: Span) -> Result<Annotations, ParseError> {
    let missing = |what: &str| ParseError {
        message: format!("missing `\"{what}: ..\";` annotation at the top of the function body"),
        span: at,
    };
    Ok(Annotations {
        types: pending.types.ok_or_else(|| missing("TYPES"))?,
        precondition: pending.precondition.ok_or_else(|| missing("PRECONDITION"))?,
        check: pending.check.ok_or_else(|| missing("CHECK"))?,
    })
}

fn duplicate_annotation(what: &str, span: Span) -> ParseError {
    ParseError {
        message: format!("{what} annotation given more than once"),
        span,
    }
}

fn describe(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::LParen => "`(`",
        TokenKind::RParen => "`)`",
        TokenKind::LBrace => "`{`",
        TokenKind::RBrace => "`}`",
        TokenKind::LBracket => "`[`",
        TokenKind::RBracket => "`]`",
        TokenKind::Semi => "`;`",
        TokenKind::Colon => "`:`",
        TokenKind::Comma => "`,`",
        TokenKind::Eq => "`=`",
        TokenKind::Lt => "`<`",
        TokenKind::Gt => "`>`",
        TokenKind::KwIf => "`if`",
        TokenKind::KwWhile => "`while`",
        TokenKind::Ident(_) => "identifier",
        _ => "a different token",
    }
}

fn rhs_span(rhs: &Rhs) -> Span {
    match rhs {
        Rhs::Expr(e) => e.span,
        Rhs::Laplace(l) => l.span,
    }
}

fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr {
        span: join(left.span, right.span),
        kind: ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
    }
}

fn join(a: Span, b: Span) -> Span {
    let a0: usize = a.offset();
    let b0: usize = b.offset();
    let start = a0.min(b0);
    let end = (a0 + a.len()).max(b0 + b.len());
    span_between(start, end)
}
