#![forbid(unsafe_code)]

mod lexer;
mod token;

pub use lexer::{LexError, Lexer};
pub use token::{Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .lex()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lex_skips_both_comment_styles() {
        let toks = kinds("int i = 0; // trailing\n/* block\n * comment */ i = i + 1;");
        assert_eq!(
            toks,
            vec![
                TokenKind::KwInt,
                TokenKind::Ident("i".into()),
                TokenKind::Eq,
                TokenKind::Int(0),
                TokenKind::Semi,
                TokenKind::Ident("i".into()),
                TokenKind::Eq,
                TokenKind::Ident("i".into()),
                TokenKind::Plus,
                TokenKind::Int(1),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_two_char_operators_before_one_char() {
        let toks = kinds("a <= b >= c == d != e && f || !g % h");
        assert!(toks.contains(&TokenKind::Le));
        assert!(toks.contains(&TokenKind::Ge));
        assert!(toks.contains(&TokenKind::EqEq));
        assert!(toks.contains(&TokenKind::Neq));
        assert!(toks.contains(&TokenKind::AndAnd));
        assert!(toks.contains(&TokenKind::OrOr));
        assert!(toks.contains(&TokenKind::Bang));
        assert!(toks.contains(&TokenKind::Percent));
        assert!(!toks.contains(&TokenKind::Lt));
    }

    #[test]
    fn lex_annotation_string_and_decimal() {
        let toks = kinds("\"CHECK: 0.5 * epsilon\"; x = 2.25;");
        assert_eq!(toks[0], TokenKind::String("CHECK: 0.5 * epsilon".into()));
        assert!(toks.contains(&TokenKind::Decimal("2.25".into())));
    }

    #[test]
    fn lex_offset_spans_are_absolute() {
        let toks = Lexer::with_offset("NN > 0", 40).lex().unwrap();
        assert_eq!(toks[0].span.offset(), 40);
        assert_eq!(toks[2].span.offset(), 45);
    }

    #[test]
    fn lex_rejects_stray_characters() {
        let err = Lexer::new("int x = 1 @ 2;").lex().unwrap_err();
        assert!(err.message.contains("unexpected character"));
    }
}
