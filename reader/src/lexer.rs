//! The tokeniser.

use lilycc_codegen::ast::Pos;
use std::fmt;

/// The kinds of token the parser consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Int(u64),
    Str(String),
    /// Keywords and punctuation, by spelling.
    Punct(&'static str),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier '{name}'"),
            TokenKind::Int(value) => write!(f, "number {value}"),
            TokenKind::Str(_) => write!(f, "string literal"),
            TokenKind::Punct(p) => write!(f, "'{p}'"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

/// One token with its source span.
#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
}

/// Keywords recognised as such.
const KEYWORDS: &[&str] = &[
    "void", "bool", "char", "short", "int", "long", "signed", "unsigned", "float", "double",
    "if", "else", "while", "do", "for", "return", "asm", "volatile", "const",
];

/// Multi-character operators, longest first so maximal munch works.
const OPERATORS: &[&str] = &[
    "<<=", ">>=", "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "++", "--", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "=", "<", ">", "+", "-", "*", "/", "%", "!", "~", "&", "|", "^",
    "(", ")", "[", "]", "{", "}", ";", ",", ":",
];

/// The tokeniser. Peekable one token ahead through [`Lexer::peek`].
/// Cloning is cheap and gives the parser bounded lookahead.
#[derive(Clone)]
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            peeked: None,
        }
    }

    fn cur(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.cur()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.cur() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.at(1) == Some(b'/') => {
                    while let Some(c) = self.cur() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    while let Some(c) = self.bump() {
                        if c == b'*' && self.cur() == Some(b'/') {
                            self.bump();
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn here(&self) -> (u32, u32) {
        (self.col, self.line)
    }

    fn span(&self, start: (u32, u32)) -> Pos {
        Pos {
            x0: start.0,
            y0: start.1,
            x1: self.col,
            y1: self.line,
        }
    }

    fn escape(&mut self) -> u8 {
        match self.bump() {
            Some(b'n') => b'\n',
            Some(b'r') => b'\r',
            Some(b't') => b'\t',
            Some(b'0') => 0,
            Some(c) => c,
            None => 0,
        }
    }

    /// Peek at the next token without consuming it.
    pub fn peek(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex());
        }
        self.peeked.as_ref().expect("just filled")
    }

    /// Consume and return the next token.
    pub fn next_token(&mut self) -> Token {
        match self.peeked.take() {
            Some(token) => token,
            None => self.lex(),
        }
    }

    fn lex(&mut self) -> Token {
        self.skip_trivia();
        let start = self.here();
        let c = match self.cur() {
            Some(c) => c,
            None => {
                return Token {
                    kind: TokenKind::Eof,
                    pos: self.span(start),
                }
            }
        };

        // Numbers: decimal, hexadecimal, octal.
        if c.is_ascii_digit() {
            let begin = self.pos;
            while matches!(self.cur(), Some(c) if c.is_ascii_alphanumeric()) {
                self.bump();
            }
            let text = core::str::from_utf8(&self.src[begin..self.pos]).unwrap_or("");
            let value = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else if text.len() > 1 && text.starts_with('0') {
                u64::from_str_radix(&text[1..], 8)
            } else {
                text.parse()
            }
            .unwrap_or(0);
            return Token {
                kind: TokenKind::Int(value),
                pos: self.span(start),
            };
        }

        // Identifiers and keywords.
        if c.is_ascii_alphabetic() || c == b'_' {
            let begin = self.pos;
            while matches!(self.cur(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                self.bump();
            }
            let text = core::str::from_utf8(&self.src[begin..self.pos]).unwrap_or("");
            let kind = match KEYWORDS.iter().find(|kw| **kw == text) {
                Some(kw) => TokenKind::Punct(kw),
                None => TokenKind::Ident(text.to_string()),
            };
            return Token {
                kind,
                pos: self.span(start),
            };
        }

        // String literals (used by asm statements).
        if c == b'"' {
            self.bump();
            let mut text = Vec::new();
            while let Some(c) = self.bump() {
                match c {
                    b'"' => break,
                    b'\\' => text.push(self.escape()),
                    c => text.push(c),
                }
            }
            return Token {
                kind: TokenKind::Str(String::from_utf8_lossy(&text).into_owned()),
                pos: self.span(start),
            };
        }

        // Character constants are just small integers.
        if c == b'\'' {
            self.bump();
            let value = match self.bump() {
                Some(b'\\') => self.escape(),
                Some(c) => c,
                None => 0,
            };
            if self.cur() == Some(b'\'') {
                self.bump();
            }
            return Token {
                kind: TokenKind::Int(value as u64),
                pos: self.span(start),
            };
        }

        // Operators and punctuation, maximal munch.
        for op in OPERATORS {
            if self.src[self.pos..].starts_with(op.as_bytes()) {
                for _ in 0..op.len() {
                    self.bump();
                }
                return Token {
                    kind: TokenKind::Punct(op),
                    pos: self.span(start),
                };
            }
        }

        // Skip the offending byte so the parser sees a clean error.
        self.bump();
        Token {
            kind: TokenKind::Punct("<bad>"),
            pos: self.span(start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push(token.kind);
        }
    }

    #[test]
    fn numbers() {
        assert_eq!(
            kinds("12 0x1f 017 'A'"),
            vec![
                TokenKind::Int(12),
                TokenKind::Int(0x1f),
                TokenKind::Int(0o17),
                TokenKind::Int(65),
            ]
        );
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            kinds("while whilex"),
            vec![
                TokenKind::Punct("while"),
                TokenKind::Ident("whilex".to_string()),
            ]
        );
    }

    #[test]
    fn maximal_munch() {
        assert_eq!(
            kinds("a<<=b<<c<d"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Punct("<<="),
                TokenKind::Ident("b".into()),
                TokenKind::Punct("<<"),
                TokenKind::Ident("c".into()),
                TokenKind::Punct("<"),
                TokenKind::Ident("d".into()),
            ]
        );
    }

    #[test]
    fn comments_and_positions() {
        let mut lexer = Lexer::new("a // comment\n  b /* x */ c");
        let a = lexer.next_token();
        let b = lexer.next_token();
        let c = lexer.next_token();
        assert_eq!(a.pos.y0, 1);
        assert_eq!(b.pos.y0, 2);
        assert_eq!(b.pos.x0, 3);
        assert_eq!(c.pos.y0, 2);
        assert!(matches!(c.kind, TokenKind::Ident(ref n) if n == "c"));
    }
}
