//! Tokenizer for Clove source text
//!
//! Produces positioned tokens: delimiters (including the `#{` and `#(`
//! dispatch forms), the full number surface (decimal, hex, octal, radix,
//! ratios, exponent floats, `N`/`M` suffixes), strings with escape
//! validation, character literals, keywords and symbols, comments and the
//! shebang line, and the remaining dispatch prefixes (`#_ #' #" #? ##`
//! and tagged-literal heads).
//!
//! Commas are whitespace. Lines and columns are 1-indexed.

use crate::config::ReadLimits;
use crate::error::SyntaxError;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    /// `#{`
    SetOpen,
    /// `#(`
    FnOpen,
    /// `'`
    Quote,
    /// backquote
    SyntaxQuote,
    /// `~`
    Unquote,
    /// `~@`
    UnquoteSplicing,
    /// `@`
    Deref,
    /// `^`
    Meta,
    /// `#'`
    VarQuote,
    /// `#_`
    Discard,
    /// `#?`
    ReaderCond,
    /// `##Inf` and friends; the payload is the symbol text
    SymbolicValue(Rc<str>),
    /// `#tag`
    TaggedLiteral(Rc<str>),
    Str(Rc<str>),
    /// `#"pattern"` with the pattern kept raw
    Regex(Rc<str>),
    Int(i64),
    Float(f64),
    Ratio(Rc<str>),
    BigInt(Rc<str>),
    BigDecimal(Rc<str>),
    Char(char),
    Keyword {
        name: Rc<str>,
        ns: Option<Rc<str>>,
        auto: bool,
    },
    Symbol {
        name: Rc<str>,
        ns: Option<Rc<str>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

pub fn tokenize(source: &str, limits: &ReadLimits) -> Result<Vec<Token>, SyntaxError> {
    Tokenizer::new(source, limits).run()
}

struct Tokenizer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    limits: &'a ReadLimits,
    tokens: Vec<Token>,
}

fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, ',' | ';' | '(' | ')' | '[' | ']' | '{' | '}' | '\'' | '`' | '~' | '@' | '^' | '"' | '\\')
}

impl<'a> Tokenizer<'a> {
    fn new(source: &'a str, limits: &'a ReadLimits) -> Self {
        Tokenizer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            limits,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn err(&self, message: impl Into<String>, line: u32, col: u32) -> SyntaxError {
        SyntaxError::new(message, line, col)
    }

    fn push(&mut self, kind: TokenKind, line: u32, col: u32) {
        self.tokens.push(Token { kind, line, col });
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                // commas are whitespace
                c if c.is_whitespace() || c == ',' => {
                    self.bump();
                }
                ';' => self.skip_line(),
                '(' => {
                    self.bump();
                    self.push(TokenKind::LParen, line, col);
                }
                ')' => {
                    self.bump();
                    self.push(TokenKind::RParen, line, col);
                }
                '[' => {
                    self.bump();
                    self.push(TokenKind::LBracket, line, col);
                }
                ']' => {
                    self.bump();
                    self.push(TokenKind::RBracket, line, col);
                }
                '{' => {
                    self.bump();
                    self.push(TokenKind::LBrace, line, col);
                }
                '}' => {
                    self.bump();
                    self.push(TokenKind::RBrace, line, col);
                }
                '\'' => {
                    self.bump();
                    self.push(TokenKind::Quote, line, col);
                }
                '`' => {
                    self.bump();
                    self.push(TokenKind::SyntaxQuote, line, col);
                }
                '~' => {
                    self.bump();
                    if self.peek() == Some('@') {
                        self.bump();
                        self.push(TokenKind::UnquoteSplicing, line, col);
                    } else {
                        self.push(TokenKind::Unquote, line, col);
                    }
                }
                '@' => {
                    self.bump();
                    self.push(TokenKind::Deref, line, col);
                }
                '^' => {
                    self.bump();
                    self.push(TokenKind::Meta, line, col);
                }
                '"' => self.read_string(line, col)?,
                '\\' => self.read_char_literal(line, col)?,
                '#' => self.read_dispatch(line, col)?,
                ':' => self.read_keyword(line, col)?,
                c if c.is_ascii_digit() => self.read_number(line, col)?,
                '+' | '-' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.read_number(line, col)?
                }
                c if is_symbol_char(c) => self.read_symbol(line, col)?,
                other => {
                    return Err(self.err(format!("unexpected character '{}'", other), line, col));
                }
            }
        }
        Ok(self.tokens)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn read_string(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            // limits apply even on malformed input, reported at the
            // opening quote
            if out.len() > self.limits.max_string_bytes {
                return Err(self.err(
                    format!(
                        "string literal exceeds {} bytes",
                        self.limits.max_string_bytes
                    ),
                    line,
                    col,
                ));
            }
            let Some(c) = self.bump() else {
                return Err(self.err("unterminated string literal", line, col));
            };
            match c {
                '"' => break,
                '\\' => {
                    let (esc_line, esc_col) = (self.line, self.col);
                    let Some(esc) = self.bump() else {
                        return Err(self.err("unterminated string literal", line, col));
                    };
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        'u' => out.push(self.read_unicode_escape(esc_line, esc_col)?),
                        other => {
                            return Err(self.err(
                                format!("unsupported escape character: \\{}", other),
                                esc_line,
                                esc_col,
                            ));
                        }
                    }
                }
                other => out.push(other),
            }
        }
        self.push(TokenKind::Str(out.into()), line, col);
        Ok(())
    }

    fn read_unicode_escape(&mut self, line: u32, col: u32) -> Result<char, SyntaxError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let Some(d) = self.bump().and_then(|c| c.to_digit(16)) else {
                return Err(self.err("invalid unicode escape, expected \\uXXXX", line, col));
            };
            code = code * 16 + d;
        }
        char::from_u32(code)
            .ok_or_else(|| self.err(format!("invalid unicode scalar \\u{:04X}", code), line, col))
    }

    fn read_char_literal(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        self.bump(); // backslash
        let Some(first) = self.bump() else {
            return Err(self.err("unexpected end of input after \\", line, col));
        };
        let mut word = String::from(first);
        if first.is_alphanumeric() {
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() {
                    word.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let c = match word.as_str() {
            "newline" => '\n',
            "space" => ' ',
            "tab" => '\t',
            "return" => '\r',
            "backspace" => '\u{8}',
            "formfeed" => '\u{c}',
            w if w.chars().count() == 1 => first,
            w if w.starts_with('u') && w.len() == 5 => {
                let code = u32::from_str_radix(&w[1..], 16)
                    .map_err(|_| self.err(format!("invalid character literal \\{}", w), line, col))?;
                char::from_u32(code).ok_or_else(|| {
                    self.err(format!("invalid character literal \\{}", w), line, col)
                })?
            }
            w if w.starts_with('o') && w.len() >= 2 && w.len() <= 4 => {
                let code = u32::from_str_radix(&w[1..], 8)
                    .map_err(|_| self.err(format!("invalid character literal \\{}", w), line, col))?;
                char::from_u32(code).ok_or_else(|| {
                    self.err(format!("invalid character literal \\{}", w), line, col)
                })?
            }
            w => return Err(self.err(format!("unsupported character: \\{}", w), line, col)),
        };
        self.push(TokenKind::Char(c), line, col);
        Ok(())
    }

    fn read_dispatch(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        self.bump(); // '#'
        match self.peek() {
            Some('{') => {
                self.bump();
                self.push(TokenKind::SetOpen, line, col);
            }
            Some('(') => {
                self.bump();
                self.push(TokenKind::FnOpen, line, col);
            }
            Some('_') => {
                self.bump();
                self.push(TokenKind::Discard, line, col);
            }
            Some('\'') => {
                self.bump();
                self.push(TokenKind::VarQuote, line, col);
            }
            Some('?') => {
                self.bump();
                self.push(TokenKind::ReaderCond, line, col);
            }
            Some('!') => self.skip_line(),
            Some('"') => self.read_regex(line, col)?,
            Some('#') => {
                self.bump();
                let word = self.take_symbol_text();
                if word.is_empty() {
                    return Err(self.err("expected symbolic value after ##", line, col));
                }
                self.push(TokenKind::SymbolicValue(word.into()), line, col);
            }
            Some(c) if is_symbol_char(c) && !c.is_ascii_digit() => {
                let word = self.take_symbol_text();
                self.push(TokenKind::TaggedLiteral(word.into()), line, col);
            }
            Some(other) => {
                return Err(self.err(format!("invalid dispatch character '#{}'", other), line, col));
            }
            None => return Err(self.err("unexpected end of input after #", line, col)),
        }
        Ok(())
    }

    fn read_regex(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.err("unterminated regex literal", line, col));
            };
            match c {
                '"' => break,
                '\\' => {
                    let Some(next) = self.bump() else {
                        return Err(self.err("unterminated regex literal", line, col));
                    };
                    // the pattern text stays raw apart from the quote
                    if next == '"' {
                        out.push('"');
                    } else {
                        out.push('\\');
                        out.push(next);
                    }
                }
                other => out.push(other),
            }
        }
        self.push(TokenKind::Regex(out.into()), line, col);
        Ok(())
    }

    /// Symbol continuation also accepts `'` (for `+'` and friends); a
    /// leading quote is always the quote macro.
    fn take_symbol_text(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if is_symbol_char(c) || (c == '\'' && !out.is_empty()) {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        out
    }

    fn read_keyword(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        self.bump(); // ':'
        let auto = self.peek() == Some(':');
        if auto {
            self.bump();
        }
        let text = self.take_symbol_text();
        if text.is_empty() {
            return Err(self.err("expected name after ':'", line, col));
        }
        let (ns, name) = split_name(&text)
            .ok_or_else(|| self.err(format!("invalid keyword :{}", text), line, col))?;
        if auto && ns.is_some() {
            return Err(self.err(
                "auto-resolved keyword cannot carry a namespace",
                line,
                col,
            ));
        }
        self.push(TokenKind::Keyword { name, ns, auto }, line, col);
        Ok(())
    }

    fn read_symbol(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        let text = self.take_symbol_text();
        let (ns, name) = split_name(&text)
            .ok_or_else(|| self.err(format!("invalid symbol {}", text), line, col))?;
        self.push(TokenKind::Symbol { name, ns }, line, col);
        Ok(())
    }

    fn read_number(&mut self, line: u32, col: u32) -> Result<(), SyntaxError> {
        let mut text = String::new();
        if matches!(self.peek(), Some('+') | Some('-')) {
            text.push(self.bump().unwrap_or('+'));
        }
        while let Some(c) = self.peek() {
            if is_symbol_char(c) {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = classify_number(&text)
            .ok_or_else(|| self.err(format!("invalid number: {}", text), line, col))?;
        self.push(kind, line, col);
        Ok(())
    }
}

/// Split `ns/name` symbol text; `/` alone is the division symbol and
/// `ns//` names the `/` symbol inside a namespace.
fn split_name(text: &str) -> Option<(Option<Rc<str>>, Rc<str>)> {
    if text == "/" {
        return Some((None, "/".into()));
    }
    match text.find('/') {
        None => Some((None, text.into())),
        Some(0) => None,
        Some(i) => {
            let ns = &text[..i];
            let name = &text[i + 1..];
            if name == "/" {
                return Some((Some(ns.into()), "/".into()));
            }
            if name.is_empty() || name.contains('/') {
                return None;
            }
            Some((Some(ns.into()), name.into()))
        }
    }
}

fn classify_number(text: &str) -> Option<TokenKind> {
    let (sign, body) = match text.as_bytes().first() {
        Some(b'+') => (1i64, &text[1..]),
        Some(b'-') => (-1i64, &text[1..]),
        _ => (1, text),
    };
    if body.is_empty() {
        return None;
    }

    // ratio: N/M, preserved textually
    if let Some(i) = body.find('/') {
        let (n, m) = (&body[..i], &body[i + 1..]);
        if !n.is_empty()
            && !m.is_empty()
            && n.bytes().all(|b| b.is_ascii_digit())
            && m.bytes().all(|b| b.is_ascii_digit())
        {
            return Some(TokenKind::Ratio(text.into()));
        }
        return None;
    }

    // big-int / big-decimal suffixes keep their text
    if let Some(base) = body.strip_suffix('N') {
        if !base.is_empty() && base.bytes().all(|b| b.is_ascii_digit()) {
            let mut out = String::new();
            if sign < 0 {
                out.push('-');
            }
            out.push_str(base);
            return Some(TokenKind::BigInt(out.into()));
        }
        return None;
    }
    if let Some(base) = body.strip_suffix('M') {
        if !base.is_empty() && is_decimal_text(base) {
            let mut out = String::new();
            if sign < 0 {
                out.push('-');
            }
            out.push_str(base);
            return Some(TokenKind::BigDecimal(out.into()));
        }
        return None;
    }

    // hex
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16)
            .ok()
            .map(|v| TokenKind::Int(sign * v));
    }

    // radix NrDDDD
    if let Some(i) = body.find(['r', 'R']) {
        let (radix, digits) = (&body[..i], &body[i + 1..]);
        if radix.bytes().all(|b| b.is_ascii_digit()) && !radix.is_empty() && !digits.is_empty() {
            let radix: u32 = radix.parse().ok()?;
            if (2..=36).contains(&radix) {
                return i64::from_str_radix(digits, radix)
                    .ok()
                    .map(|v| TokenKind::Int(sign * v));
            }
        }
        return None;
    }

    // float
    if body.contains(['.', 'e', 'E']) {
        if is_decimal_text(body) {
            return body.parse::<f64>().ok().map(|v| {
                TokenKind::Float(if sign < 0 { -v } else { v })
            });
        }
        return None;
    }

    // octal 0NNN
    if body.len() > 1 && body.starts_with('0') {
        return i64::from_str_radix(&body[1..], 8)
            .ok()
            .map(|v| TokenKind::Int(sign * v));
    }

    body.parse::<i64>().ok().map(|v| TokenKind::Int(sign * v))
}

fn is_decimal_text(text: &str) -> bool {
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut prev: Option<char> = None;
    for c in text.chars() {
        match c {
            '0'..='9' => {}
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'e' | 'E' if !seen_exp && prev.is_some_and(|p| p.is_ascii_digit()) => seen_exp = true,
            '+' | '-' if matches!(prev, Some('e') | Some('E')) => {}
            _ => return false,
        }
        prev = Some(c);
    }
    text.chars().last().is_some_and(|c| c.is_ascii_digit())
}
