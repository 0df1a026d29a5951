// ============================================================================
// PROMQL LEXER
// ============================================================================
// Turns an expression string into a flat token stream. Keywords are resolved
// by the parser since most of them are only reserved in context.
// ============================================================================

use std::time::Duration;

use crate::error::ParseError;

/// A lexical token with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Duration(Duration),
    Str(String),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    At,

    // ---- Operators ----
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    Neq,
    Lss,
    Lte,
    Gtr,
    Gte,
    Assign,
    EqlRegex,
    NeqRegex,

    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("identifier \"{s}\""),
            TokenKind::Number(n) => format!("number \"{n}\""),
            TokenKind::Duration(d) => format!("duration \"{}\"", humantime::format_duration(*d)),
            TokenKind::Str(s) => format!("string \"{s}\""),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("\"{}\"", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::At => "@",
            TokenKind::Add => "+",
            TokenKind::Sub => "-",
            TokenKind::Mul => "*",
            TokenKind::Div => "/",
            TokenKind::Mod => "%",
            TokenKind::Pow => "^",
            TokenKind::Eql => "==",
            TokenKind::Neq => "!=",
            TokenKind::Lss => "<",
            TokenKind::Lte => "<=",
            TokenKind::Gtr => ">",
            TokenKind::Gte => ">=",
            TokenKind::Assign => "=",
            TokenKind::EqlRegex => "=~",
            TokenKind::NeqRegex => "!~",
            _ => "",
        }
    }
}

/// Lex a whole expression. The returned stream always ends with `Eof`.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(input).run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<Token>,
    // last bracket seen was `[`
    in_brackets: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
            in_brackets: false,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'#' => self.skip_comment(),
                b'(' => self.single(TokenKind::LParen),
                b')' => self.single(TokenKind::RParen),
                b'{' => self.single(TokenKind::LBrace),
                b'}' => self.single(TokenKind::RBrace),
                b'[' => self.single(TokenKind::LBracket),
                b']' => self.single(TokenKind::RBracket),
                b',' => self.single(TokenKind::Comma),
                b':' if !self.ident_follows_colon() => self.single(TokenKind::Colon),
                b'@' => self.single(TokenKind::At),
                b'+' => self.single(TokenKind::Add),
                b'-' => self.single(TokenKind::Sub),
                b'*' => self.single(TokenKind::Mul),
                b'/' => self.single(TokenKind::Div),
                b'%' => self.single(TokenKind::Mod),
                b'^' => self.single(TokenKind::Pow),
                b'=' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::Eql),
                    Some(b'~') => self.double(TokenKind::EqlRegex),
                    _ => self.single(TokenKind::Assign),
                },
                b'!' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::Neq),
                    Some(b'~') => self.double(TokenKind::NeqRegex),
                    _ => return Err(ParseError::new(start, "unexpected character after '!'")),
                },
                b'<' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::Lte),
                    _ => self.single(TokenKind::Lss),
                },
                b'>' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::Gte),
                    _ => self.single(TokenKind::Gtr),
                },
                b'"' | b'\'' | b'`' => {
                    let s = self.string(c)?;
                    self.push(TokenKind::Str(s), start);
                }
                b'0'..=b'9' => {
                    let kind = self.number_or_duration()?;
                    self.push(kind, start);
                }
                b'.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    let kind = self.number_or_duration()?;
                    self.push(kind, start);
                }
                c if is_ident_start(c) => {
                    let ident = self.ident();
                    self.push(TokenKind::Ident(ident), start);
                }
                _ => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    return Err(ParseError::new(start, format!("unexpected character: '{ch}'")));
                }
            }
        }
        let end = self.pos;
        self.push(TokenKind::Eof, end);
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, pos: usize) {
        match kind {
            TokenKind::LBracket => self.in_brackets = true,
            TokenKind::RBracket => self.in_brackets = false,
            _ => {}
        }
        self.tokens.push(Token { kind, pos });
    }

    fn single(&mut self, kind: TokenKind) {
        let pos = self.pos;
        self.pos += 1;
        self.push(kind, pos);
    }

    fn double(&mut self, kind: TokenKind) {
        let pos = self.pos;
        self.pos += 2;
        self.push(kind, pos);
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// A leading colon starts a metric name (`:foo`) unless it separates a
    /// subquery range from its step.
    fn ident_follows_colon(&self) -> bool {
        !self.in_brackets && self.peek_at(1).is_some_and(is_ident_char)
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn string(&mut self, quote: u8) -> Result<String, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ParseError::new(start, "unterminated quoted string"));
            };
            if c == quote {
                self.pos += 1;
                return Ok(out);
            }
            if c == b'\\' && quote != b'`' {
                let escaped = self
                    .peek_at(1)
                    .ok_or_else(|| ParseError::new(self.pos, "unterminated escape sequence"))?;
                let resolved = match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    b'\\' => '\\',
                    b'"' => '"',
                    b'\'' => '\'',
                    b'.' | b'-' | b'+' | b'*' | b'?' | b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'|'
                    | b'^' | b'$' | b'/' | b'd' | b'w' | b's' => {
                        // regex escapes pass through untouched
                        out.push('\\');
                        escaped as char
                    }
                    other => {
                        return Err(ParseError::new(
                            self.pos,
                            format!("unknown escape sequence '\\{}'", other as char),
                        ))
                    }
                };
                out.push(resolved);
                self.pos += 2;
                continue;
            }
            if c == b'\n' && quote != b'`' {
                return Err(ParseError::new(start, "unterminated quoted string"));
            }
            let ch = self.src[self.pos..].chars().next().unwrap_or('\u{FFFD}');
            out.push(ch);
            self.pos += ch.len_utf8();
        }
    }

    /// Numbers and durations share a prefix; read the whole word and decide.
    fn number_or_duration(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let exponent_sign = (c == b'+' || c == b'-')
                && matches!(self.bytes.get(self.pos.wrapping_sub(1)), Some(b'e') | Some(b'E'))
                && !self.src[start..self.pos].starts_with("0x");
            if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = &self.src[start..self.pos];
        if let Some(d) = parse_duration(word) {
            return Ok(TokenKind::Duration(d));
        }
        parse_number(word)
            .map(TokenKind::Number)
            .ok_or_else(|| ParseError::new(start, format!("bad number or duration syntax: \"{word}\"")))
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b':'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b':'
}

fn parse_number(word: &str) -> Option<f64> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    if word.bytes().any(|c| c.is_ascii_alphabetic() && c != b'e' && c != b'E') {
        return None;
    }
    word.parse::<f64>().ok()
}

/// Parse a PromQL duration such as `5m`, `1h30m` or `250ms`.
pub fn parse_duration(word: &str) -> Option<Duration> {
    let bytes = word.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_digit() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut i = 0;
    while i < bytes.len() {
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if digits_start == i {
            return None;
        }
        let value: u64 = word[digits_start..i].parse().ok()?;
        let unit_ms: u64 = if word[i..].starts_with("ms") {
            i += 2;
            1
        } else {
            let unit = *bytes.get(i)?;
            i += 1;
            match unit {
                b's' => 1_000,
                b'm' => 60_000,
                b'h' => 3_600_000,
                b'd' => 86_400_000,
                b'w' => 604_800_000,
                b'y' => 31_536_000_000,
                _ => return None,
            }
        };
        total += Duration::from_millis(value.checked_mul(unit_ms)?);
    }
    Some(total)
}

// ============================================================================
// TESTS
// ============================================================================
