// src/frontend/lexer.rs

use crate::frontend::{Locus, Token, TokenKind};

pub struct Lexer<'src> {
    chars: std::iter::Peekable<std::str::CharIndices<'src>>,
    source: &'src str,
    current: usize,
    line: u32,
    column: u32,
    start: Locus,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            source,
            current: 0,
            line: 1,
            column: 1,
            start: Locus::default(),
        }
    }

    /// Get the next token from the source.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        self.start = Locus {
            line: self.line,
            column: self.column,
            offset: self.current as u32,
        };

        let Some(c) = self.advance() else {
            return self.make(TokenKind::Eof);
        };

        match c {
            '(' => self.make(TokenKind::LParen),
            ')' => self.make(TokenKind::RParen),
            '"' => self.string(),
            '$' => self.name(),
            c if c.is_ascii_digit() => self.number(c, false),
            '-' | '+' => {
                if self.peek().is_some_and(|n| n.is_ascii_digit()) {
                    let first = self.advance().unwrap();
                    self.number(first, c == '-')
                } else {
                    self.symbol(c)
                }
            }
            c => self.symbol(c),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') | Some('\n') => {
                    self.advance();
                }
                Some(';') => {
                    // ;; line comment. A stray single ';' is left for
                    // the token path to report.
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek().map(|&(_, c)| c) == Some(';') {
                        self.advance();
                        self.advance();
                        while self.peek().is_some() && self.peek() != Some('\n') {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                Some('(') => {
                    // (; block comment ;)
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek().map(|&(_, c)| c) == Some(';') {
                        self.advance();
                        self.advance();
                        let mut depth = 1;
                        while depth > 0 {
                            match self.advance() {
                                Some(';') if self.peek() == Some(')') => {
                                    self.advance();
                                    depth -= 1;
                                }
                                Some('(') if self.peek() == Some(';') => {
                                    self.advance();
                                    depth += 1;
                                }
                                Some(_) => {}
                                None => return,
                            }
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn advance(&mut self) -> Option<char> {
        let (i, c) = self.chars.next()?;
        self.current = i + c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.start)
    }

    fn is_atom_char(c: char) -> bool {
        !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | ';')
    }

    fn symbol(&mut self, first: char) -> Token {
        if !Self::is_atom_char(first) {
            return self.make(TokenKind::Error(format!("unexpected character '{}'", first)));
        }
        let mut text = String::new();
        text.push(first);
        while self.peek().is_some_and(Self::is_atom_char) {
            text.push(self.advance().unwrap());
        }
        self.make(TokenKind::Symbol(text))
    }

    fn name(&mut self) -> Token {
        let mut text = String::new();
        while self.peek().is_some_and(Self::is_atom_char) {
            text.push(self.advance().unwrap());
        }
        if text.is_empty() {
            self.make(TokenKind::Error("expected name after '$'".to_string()))
        } else {
            self.make(TokenKind::Name(text))
        }
    }

    fn number(&mut self, first: char, negative: bool) -> Token {
        let mut digits = String::new();
        digits.push(first);

        // Hex integers
        if first == '0' && self.peek() == Some('x') {
            self.advance();
            let mut hex = String::new();
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                hex.push(self.advance().unwrap());
            }
            return match u64::from_str_radix(&hex, 16) {
                Ok(value) => {
                    let value = value as i64;
                    self.make(TokenKind::Int(if negative { value.wrapping_neg() } else { value }))
                }
                Err(_) => self.make(TokenKind::Error("invalid hex literal".to_string())),
            };
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            digits.push(self.advance().unwrap());
        }

        let mut is_decimal = false;
        if self.peek() == Some('.') {
            is_decimal = true;
            digits.push(self.advance().unwrap());
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                digits.push(self.advance().unwrap());
            }
        }
        if self.peek() == Some('e') || self.peek() == Some('E') {
            is_decimal = true;
            digits.push(self.advance().unwrap());
            if self.peek() == Some('-') || self.peek() == Some('+') {
                digits.push(self.advance().unwrap());
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                digits.push(self.advance().unwrap());
            }
        }

        if is_decimal {
            match digits.parse::<f64>() {
                Ok(value) => self.make(TokenKind::Decimal(if negative { -value } else { value })),
                Err(_) => self.make(TokenKind::Error("invalid number literal".to_string())),
            }
        } else {
            // Parse through u64 so the full unsigned range is accepted,
            // then carry the bits.
            match digits.parse::<u64>() {
                Ok(value) => {
                    let value = value as i64;
                    self.make(TokenKind::Int(if negative { value.wrapping_neg() } else { value }))
                }
                Err(_) => self.make(TokenKind::Error("invalid number literal".to_string())),
            }
        }
    }

    fn string(&mut self) -> Token {
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => {
                    return self.make(TokenKind::Error("unterminated string literal".to_string()));
                }
                Some('"') => return self.make(TokenKind::Str(bytes)),
                Some('\\') => match self.advance() {
                    Some('n') => bytes.push(b'\n'),
                    Some('t') => bytes.push(b'\t'),
                    Some('\\') => bytes.push(b'\\'),
                    Some('"') => bytes.push(b'"'),
                    Some('\'') => bytes.push(b'\''),
                    Some(c) if c.is_ascii_hexdigit() => {
                        // Two-digit hex escape.
                        let Some(c2) = self.peek().filter(|c| c.is_ascii_hexdigit()) else {
                            return self
                                .make(TokenKind::Error("invalid string escape".to_string()));
                        };
                        self.advance();
                        let hi = c.to_digit(16).unwrap() as u8;
                        let lo = c2.to_digit(16).unwrap() as u8;
                        bytes.push(hi << 4 | lo);
                    }
                    _ => return self.make(TokenKind::Error("invalid string escape".to_string())),
                },
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn lex_parens_and_symbols() {
        let toks = kinds("(module (func $f))");
        assert_eq!(
            toks,
            vec![
                TokenKind::LParen,
                TokenKind::Symbol("module".to_string()),
                TokenKind::LParen,
                TokenKind::Symbol("func".to_string()),
                TokenKind::Name("f".to_string()),
                TokenKind::RParen,
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(
            kinds("42 -7 3.5 0x10"),
            vec![
                TokenKind::Int(42),
                TokenKind::Int(-7),
                TokenKind::Decimal(3.5),
                TokenKind::Int(16),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(
            kinds(r#""a\00b""#),
            vec![TokenKind::Str(vec![b'a', 0, b'b']), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_comments() {
        assert_eq!(
            kinds(";; line\n(;, block ;) 1"),
            vec![TokenKind::Int(1), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_tracks_line_and_column() {
        let mut lexer = Lexer::new("(\n  foo");
        let lp = lexer.next_token();
        assert_eq!((lp.locus.line, lp.locus.column), (1, 1));
        let sym = lexer.next_token();
        assert_eq!((sym.locus.line, sym.locus.column), (2, 3));
    }

    #[test]
    fn lex_unterminated_string_is_an_error_token() {
        let toks = kinds("\"abc");
        assert!(matches!(toks[0], TokenKind::Error(_)));
    }
}
