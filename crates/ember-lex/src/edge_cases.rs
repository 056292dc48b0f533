//! Edge-case tests for the scanner: inputs that sit right on the boundary of
//! a lexical rule, plus a couple of generative checks.

use crate::{Scanner, Token, TokenKind};

fn tokens(source: &str) -> Vec<Token<'_>> {
    Scanner::new(source).into_iter().collect()
}

#[test]
fn comment_at_end_of_file_without_newline() {
    let toks = tokens("print 1; // no trailing newline");
    assert_eq!(toks.last().map(|t| t.kind), Some(TokenKind::Eof));
    assert_eq!(toks.len(), 4);
}

#[test]
fn slash_not_followed_by_slash_is_division() {
    let toks = tokens("1 / 2");
    assert_eq!(toks[1].kind, TokenKind::Slash);
}

#[test]
fn keywords_adjacent_to_punctuation() {
    let toks = tokens("if(true){return;}");
    let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
    use TokenKind::*;
    assert_eq!(
        kinds,
        vec![If, LeftParen, True, RightParen, LeftBrace, Return, Semicolon, RightBrace, Eof]
    );
}

#[test]
fn identifiers_may_contain_digits_and_underscores() {
    let toks = tokens("_private x2 snake_case_9");
    assert!(toks[..3].iter().all(|t| t.kind == TokenKind::Identifier));
    assert_eq!(toks[2].lexeme, "snake_case_9");
}

#[test]
fn leading_dot_is_not_a_number() {
    let toks = tokens(".5");
    assert_eq!(toks[0].kind, TokenKind::Dot);
    assert_eq!(toks[1].kind, TokenKind::Number);
    assert_eq!(toks[1].lexeme, "5");
}

#[test]
fn empty_string_literal() {
    let toks = tokens("\"\"");
    assert_eq!(toks[0].kind, TokenKind::String);
    assert_eq!(toks[0].lexeme, "\"\"");
}

#[test]
fn colon_separates_class_from_superclass() {
    let toks = tokens("class A : B {}");
    let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
    use TokenKind::*;
    assert_eq!(
        kinds,
        vec![Class, Identifier, Colon, Identifier, LeftBrace, RightBrace, Eof]
    );
}

#[test]
fn non_ascii_bytes_surface_as_error_tokens_without_panicking() {
    let toks = tokens("var é = 1;");
    assert!(toks.iter().any(|t| t.kind == TokenKind::Error));
    assert_eq!(toks.last().map(|t| t.kind), Some(TokenKind::Eof));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Scanning always terminates with a single trailing Eof, whatever
        /// the input.
        #[test]
        fn scanning_always_reaches_eof(source in ".{0,200}") {
            let toks = tokens(&source);
            prop_assert_eq!(toks.last().map(|t| t.kind), Some(TokenKind::Eof));
            prop_assert_eq!(
                toks.iter().filter(|t| t.kind == TokenKind::Eof).count(),
                1
            );
        }

        /// ASCII identifiers round-trip: the token lexeme is exactly the
        /// input slice.
        #[test]
        fn identifier_lexemes_round_trip(name in "[a-zA-Z_][a-zA-Z0-9_]{0,20}") {
            let toks = tokens(&name);
            prop_assert_eq!(toks[0].lexeme, name.as_str());
        }
    }
}
