#![forbid(unsafe_code)]

use dpcheck_ast::{
    Annotations, BinOp, Block, Expr, ExprKind, IfStmt, Program, Rhs, Stmt, UnaryOp, WhileStmt,
};

const INDENT: &str = "  ";

pub fn format_program(program: &Program) -> String {
    let mut out = String::new();
    match program.ret {
        Some(ty) => out.push_str(&ty.to_string()),
        None => out.push_str("void"),
    }
    out.push(' ');
    out.push_str(&program.name.node);
    out.push('(');
    for (i, p) in program.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&p.ty.to_string());
        out.push(' ');
        out.push_str(&p.name.node);
        if p.array {
            out.push_str("[]");
        }
    }
    out.push_str(")\n{\n");
    fmt_annotations(&mut out, &program.annotations);
    if !program.body.stmts.is_empty() {
        out.push('\n');
    }
    for stmt in &program.body.stmts {
        fmt_stmt(&mut out, 1, stmt);
    }
    out.push_str("}\n");
    out
}

pub fn format_expr(expr: &Expr) -> String {
    let mut out = String::new();
    fmt_expr(&mut out, expr, Prec::Lowest);
    out
}

fn fmt_annotations(out: &mut String, a: &Annotations) {
    indent_line(out, 1);
    out.push_str("\"TYPES: ");
    for (i, t) in a.types.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&format!("{}: <{}, {}>", t.name.node, t.lo, t.hi));
    }
    out.push_str("\";\n");

    indent_line(out, 1);
    out.push_str("\"PRECONDITION: ");
    out.push_str(a.precondition.adjacency.node.keyword());
    out.push(';');
    for e in &a.precondition.assumptions {
        out.push_str(" ASSUME(");
        fmt_expr(out, e, Prec::Lowest);
        out.push_str(");");
    }
    out.push_str("\";\n");

    indent_line(out, 1);
    out.push_str("\"CHECK: ");
    fmt_expr(out, &a.check, Prec::Lowest);
    out.push_str("\";\n");
}

fn fmt_stmt(out: &mut String, indent: usize, stmt: &Stmt) {
    match stmt {
        Stmt::Decl(d) => {
            indent_line(out, indent);
            out.push_str(&d.ty.to_string());
            out.push(' ');
            out.push_str(&d.name.node);
            if let Some(init) = &d.init {
                out.push_str(" = ");
                fmt_rhs(out, init);
            }
            out.push_str(";\n");
        }
        Stmt::Assign(a) => {
            indent_line(out, indent);
            out.push_str(&a.target.node);
            out.push_str(" = ");
            fmt_rhs(out, &a.value);
            out.push_str(";\n");
        }
        Stmt::If(s) => fmt_if(out, indent, s),
        Stmt::While(s) => fmt_while(out, indent, s),
        Stmt::Output(o) => {
            indent_line(out, indent);
            out.push_str("CHECKDP_OUTPUT(");
            fmt_expr(out, &o.expr, Prec::Lowest);
            out.push_str(");\n");
        }
        Stmt::Break(_) => {
            indent_line(out, indent);
            out.push_str("break;\n");
        }
        Stmt::Block(b) => {
            indent_line(out, indent);
            fmt_brace_block(out, indent, b);
            out.push('\n');
        }
    }
}

fn fmt_rhs(out: &mut String, rhs: &Rhs) {
    match rhs {
        Rhs::Expr(e) => fmt_expr(out, e, Prec::Lowest),
        Rhs::Laplace(l) => {
            out.push_str("Lap(");
            fmt_expr(out, &l.scale, Prec::Lowest);
            out.push(')');
        }
    }
}

fn fmt_if(out: &mut String, indent: usize, s: &IfStmt) {
    indent_line(out, indent);
    out.push_str("if (");
    fmt_expr(out, &s.cond, Prec::Lowest);
    out.push_str(") ");
    fmt_brace_block(out, indent, &s.then_block);
    if let Some(else_block) = &s.else_block {
        out.push_str(" else ");
        fmt_brace_block(out, indent, else_block);
    }
    out.push('\n');
}

fn fmt_while(out: &mut String, indent: usize, s: &WhileStmt) {
    indent_line(out, indent);
    out.push_str("while (");
    fmt_expr(out, &s.cond, Prec::Lowest);
    out.push_str(") ");
    fmt_brace_block(out, indent, &s.body);
    out.push('\n');
}

fn fmt_brace_block(out: &mut String, indent: usize, block: &Block) {
    out.push_str("{\n");
    for stmt in &block.stmts {
        fmt_stmt(out, indent + 1, stmt);
    }
    indent_line(out, indent);
    out.push('}');
}

fn indent_line(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str(INDENT);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest,
    Or,
    And,
    Cmp,
    Add,
    Mul,
    Unary,
    Primary,
}

fn bin_prec(op: BinOp) -> Prec {
    match op {
        BinOp::Or => Prec::Or,
        BinOp::And => Prec::And,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => Prec::Cmp,
        BinOp::Add | BinOp::Sub => Prec::Add,
        BinOp::Mul | BinOp::Div | BinOp::Mod => Prec::Mul,
    }
}

fn fmt_expr(out: &mut String, expr: &Expr, parent: Prec) {
    match &expr.kind {
        ExprKind::Int(n) => out.push_str(&n.to_string()),
        ExprKind::Decimal(s) => out.push_str(s),
        ExprKind::Ident(id) => out.push_str(&id.node),
        ExprKind::Index { base, index } => {
            out.push_str(&base.node);
            out.push('[');
            fmt_expr(out, index, Prec::Lowest);
            out.push(']');
        }
        ExprKind::Unary { op, expr: inner } => {
            let parens = Prec::Unary < parent;
            if parens {
                out.push('(');
            }
            match op {
                UnaryOp::Neg => out.push('-'),
                UnaryOp::Not => out.push('!'),
            }
            fmt_expr(out, inner, Prec::Unary);
            if parens {
                out.push(')');
            }
        }
        ExprKind::Binary { left, op, right } => {
            let my = bin_prec(*op);
            let parens = my < parent;
            if parens {
                out.push('(');
            }
            fmt_expr(out, left, my);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            // Operators are left-associative: a right operand at the same level needs parentheses.
            fmt_right_operand(out, right, my);
            if parens {
                out.push(')');
            }
        }
    }
}

fn fmt_right_operand(out: &mut String, expr: &Expr, my: Prec) {
    let same_level = matches!(&expr.kind, ExprKind::Binary { op, .. } if bin_prec(*op) == my);
    if same_level {
        out.push('(');
        fmt_expr(out, expr, Prec::Lowest);
        out.push(')');
    } else {
        fmt_expr(out, expr, my);
    }
}

#[cfg(test)]
mod tests {
    use crate::parse_expr;

    use super::format_expr;

    #[test]
    fn format_keeps_required_parentheses() {
        let e = parse_expr("4 / (3 * epsilon)").unwrap();
        assert_eq!(format_expr(&e), "4 / (3 * epsilon)");
        let e = parse_expr("(i + 1) % M == 0").unwrap();
        assert_eq!(format_expr(&e), "(i + 1) % M == 0");
    }

    #[test]
    fn format_drops_redundant_parentheses() {
        let e = parse_expr("(q[i] + eta) - (T_bar)").unwrap();
        assert_eq!(format_expr(&e), "q[i] + eta - T_bar");
        let e = parse_expr("(a && b) || (c < d)").unwrap();
        assert_eq!(format_expr(&e), "a && b || c < d");
    }
}
