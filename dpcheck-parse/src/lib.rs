#![forbid(unsafe_code)]

mod error;
mod fmt;
mod parser;

use dpcheck_lex::Lexer;

pub use error::ParseError;
pub use fmt::{format_expr, format_program};
pub use parser::{LAPLACE_FN, OUTPUT_FN, Parser};

/// Labels in the returned report point into `src`.
pub fn parse_source(src: &str) -> miette::Result<dpcheck_ast::Program> {
    let tokens = Lexer::new(src).lex().map_err(miette::Report::new)?;
    let mut parser = Parser::new(&tokens);
    parser.parse_program().map_err(miette::Report::new)
}

pub fn parse_expr(src: &str) -> miette::Result<dpcheck_ast::Expr> {
    let tokens = Lexer::new(src).lex().map_err(miette::Report::new)?;
    let mut parser = Parser::new(&tokens);
    parser.parse_expr_eof().map_err(miette::Report::new)
}

/// Parse and run the structural checks of the program model.
pub fn parse_and_validate(
    src: &str,
) -> miette::Result<(dpcheck_ast::Program, dpcheck_ast::SymbolTable)> {
    let program = parse_source(src)?;
    let symbols = dpcheck_ast::validate(&program).map_err(miette::Report::new)?;
    Ok((program, symbols))
}
