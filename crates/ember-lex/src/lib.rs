//! ember-lex - Lexical analysis for the Ember scripting language.
//!
//! The scanner is single-pass and zero-copy: a [`Token`] borrows its lexeme
//! straight out of the source text, and the compiler pulls tokens lazily, one
//! at a time, so no token buffer is ever materialized. Malformed input never
//! aborts the scan; it is reported in-band as [`TokenKind::Error`] tokens
//! whose lexeme is the error message, which keeps the parser in charge of
//! all diagnostics.

mod scanner;

#[cfg(test)]
mod edge_cases;

pub use scanner::Scanner;

/// The lexical category of a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Colon,
    Slash,
    Star,
    // One- or two-character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    String,
    Number,
    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Import,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    /// Scanner-level problem; the lexeme carries the message.
    Error,
    Eof,
}

/// A single lexical unit: its kind, the source slice it covers, and the line
/// it ends on.
///
/// `Error` tokens borrow a static message instead of source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    /// A placeholder token, useful for initializing parser state before the
    /// first call to the scanner.
    pub fn synthetic(lexeme: &'src str) -> Self {
        Self {
            kind: TokenKind::Identifier,
            lexeme,
            line: 0,
        }
    }
}

/// Resolve a lexeme that matched the identifier rule to a keyword, if it is
/// one.
///
/// Dispatches on the first byte and then requires an exact match of the
/// remaining characters, so near-misses like `classs` or `supe` stay
/// identifiers.
///
/// # Examples
///
/// ```
/// use ember_lex::{keyword_kind, TokenKind};
///
/// assert_eq!(keyword_kind("while"), Some(TokenKind::While));
/// assert_eq!(keyword_kind("import"), Some(TokenKind::Import));
/// assert_eq!(keyword_kind("whale"), None);
/// ```
pub fn keyword_kind(lexeme: &str) -> Option<TokenKind> {
    let bytes = lexeme.as_bytes();
    let rest = |from: usize, expect: &str, kind: TokenKind| {
        if &lexeme[from..] == expect {
            Some(kind)
        } else {
            None
        }
    };

    match *bytes.first()? {
        b'a' => rest(1, "nd", TokenKind::And),
        b'c' => rest(1, "lass", TokenKind::Class),
        b'e' => rest(1, "lse", TokenKind::Else),
        b'f' => match bytes.get(1) {
            Some(b'a') => rest(2, "lse", TokenKind::False),
            Some(b'o') => rest(2, "r", TokenKind::For),
            Some(b'u') => rest(2, "n", TokenKind::Fun),
            _ => None,
        },
        b'i' => match bytes.get(1) {
            Some(b'f') => rest(2, "", TokenKind::If),
            Some(b'm') => rest(2, "port", TokenKind::Import),
            _ => None,
        },
        b'n' => rest(1, "il", TokenKind::Nil),
        b'o' => rest(1, "r", TokenKind::Or),
        b'p' => rest(1, "rint", TokenKind::Print),
        b'r' => rest(1, "eturn", TokenKind::Return),
        b's' => match bytes.get(1) {
            Some(b'u') => rest(2, "per", TokenKind::Super),
            _ => None,
        },
        b't' => match bytes.get(1) {
            Some(b'h') => rest(2, "is", TokenKind::This),
            Some(b'r') => rest(2, "ue", TokenKind::True),
            _ => None,
        },
        b'v' => rest(1, "ar", TokenKind::Var),
        b'w' => rest(1, "hile", TokenKind::While),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_keyword_resolves() {
        let cases = [
            ("and", TokenKind::And),
            ("class", TokenKind::Class),
            ("else", TokenKind::Else),
            ("false", TokenKind::False),
            ("for", TokenKind::For),
            ("fun", TokenKind::Fun),
            ("if", TokenKind::If),
            ("import", TokenKind::Import),
            ("nil", TokenKind::Nil),
            ("or", TokenKind::Or),
            ("print", TokenKind::Print),
            ("return", TokenKind::Return),
            ("super", TokenKind::Super),
            ("this", TokenKind::This),
            ("true", TokenKind::True),
            ("var", TokenKind::Var),
            ("while", TokenKind::While),
        ];
        for (lexeme, kind) in cases {
            assert_eq!(keyword_kind(lexeme), Some(kind), "keyword {lexeme}");
        }
    }

    #[test]
    fn prefixes_and_extensions_are_identifiers() {
        for lexeme in ["an", "ands", "classy", "f", "fo", "form", "superb", "thiss", "w"] {
            assert_eq!(keyword_kind(lexeme), None, "non-keyword {lexeme}");
        }
    }
}
