//! The scanner: source text in, one token out per call.

use crate::{keyword_kind, Token, TokenKind};

/// Zero-copy scanner over a source string.
///
/// State is three cursors: the start of the lexeme being scanned, the byte
/// just past the last consumed character, and the current line. Source is
/// treated as bytes; everything the language cares about is ASCII, and any
/// other byte inside identifiers or strings passes through untouched.
///
/// # Examples
///
/// ```
/// use ember_lex::{Scanner, TokenKind};
///
/// let mut scanner = Scanner::new("var answer = 42;");
/// assert_eq!(scanner.scan_token().kind, TokenKind::Var);
/// assert_eq!(scanner.scan_token().lexeme, "answer");
/// ```
pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan and return the next token. Returns an `Eof` token forever once
    /// the input is exhausted.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if c.is_ascii_digit() {
            return self.number();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return self.identifier();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b';' => self.make_token(TokenKind::Semicolon),
            b':' => self.make_token(TokenKind::Colon),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' if self.peek_next() == b'/' => {
                    // A comment goes until the end of the line.
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        // The closing quote.
        self.current += 1;
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }

        // A fractional part needs at least one digit after the dot.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }

        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while {
            let c = self.peek();
            c.is_ascii_alphanumeric() || c == b'_'
        } {
            self.current += 1;
        }

        let lexeme = &self.source[self.start..self.current];
        self.make_token(keyword_kind(lexeme).unwrap_or(TokenKind::Identifier))
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }
}

/// Iterator adapter yielding tokens up to and including `Eof`.
impl<'src> IntoIterator for Scanner<'src> {
    type Item = Token<'src>;
    type IntoIter = Tokens<'src>;

    fn into_iter(self) -> Tokens<'src> {
        Tokens {
            scanner: self,
            done: false,
        }
    }
}

/// Token iterator returned by [`Scanner::into_iter`].
pub struct Tokens<'src> {
    scanner: Scanner<'src>,
    done: bool,
}

impl<'src> Iterator for Tokens<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Token<'src>> {
        if self.done {
            return None;
        }
        let token = self.scanner.scan_token();
        if token.kind == TokenKind::Eof {
            self.done = true;
        }
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_punctuation_and_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("(){},.-+;:/*"),
            vec![
                LeftParen, RightParen, LeftBrace, RightBrace, Comma, Dot, Minus, Plus, Semicolon,
                Colon, Slash, Star, Eof
            ]
        );
        assert_eq!(
            kinds("! != = == > >= < <="),
            vec![Bang, BangEqual, Equal, EqualEqual, Greater, GreaterEqual, Less, LessEqual, Eof]
        );
    }

    #[test]
    fn scans_numbers() {
        let mut scanner = Scanner::new("123 3.25 9.");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Number);
        assert_eq!(token.lexeme, "123");

        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Number);
        assert_eq!(token.lexeme, "3.25");

        // A trailing dot is not part of the number.
        let token = scanner.scan_token();
        assert_eq!(token.lexeme, "9");
        assert_eq!(scanner.scan_token().kind, TokenKind::Dot);
    }

    #[test]
    fn scans_string_literals() {
        let mut scanner = Scanner::new("\"hello world\"");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"hello world\"");
    }

    #[test]
    fn string_spanning_lines_counts_them() {
        let mut scanner = Scanner::new("\"a\nb\nc\" x");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.line, 3);
        assert_eq!(scanner.scan_token().line, 3);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"oops");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        assert_eq!(
            kinds("// nothing here\n  \t\r\nprint // trailing\n1;"),
            vec![TokenKind::Print, TokenKind::Number, TokenKind::Semicolon, TokenKind::Eof]
        );
    }

    #[test]
    fn line_numbers_advance_on_newlines() {
        let tokens: Vec<_> = Scanner::new("a\nb\n\nc").into_iter().collect();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn eof_is_sticky() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
    }

    #[test]
    fn unexpected_character_is_reported() {
        let mut scanner = Scanner::new("@");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unexpected character.");
    }
}
