//! Recursive-descent parser for the surface Scheme-like syntax.
//!
//! Two stages: a hand-rolled tokenizer turns the source string into a
//! flat `Vec<Token>` carrying line/column, then a
//! `Parser { tokens, pos }` walks that stream with `check`/`consume`/
//! `advance` helpers. Every failure is appended to a `Diagnostics` list
//! instead of aborting, so the parser recovers to the next top-level form
//! and keeps going.

use crate::ast::{Expr, Pos, Program, SchemeString};
use crate::diagnostics::{Diagnostics, Kind};

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    HashLParen, // #(
    Quote,      // '
    Backquote,  // `
    Comma,      // ,
    CommaAt,    // ,@
    Str(String),
    PipeSymbol(String),
    HashChar(String), // text following #\
    HashBool(bool),
    Atom(String),
    /// Emitted by the tokenizer when a string, character, or pipe-symbol
    /// never found its closing delimiter.
    UnterminatedString,
    UnterminatedPipeSymbol,
    UnterminatedChar,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: Pos,
}

/// Quote-context state: `,`/`,@` are only legal outside `Normal`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum QuoteContext {
    Normal,
    Quote,
    QuasiQuote,
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(source: &'a str) -> Self {
        Tokenizer {
            chars: source.chars().peekable(),
            line: 0,
            column: 0,
        }
    }

    fn pos(&self) -> Pos {
        Pos::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_atmosphere(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c == ' ' || c == '\t' || c == '\r' || c == '\n' => {
                    self.bump();
                }
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            self.skip_atmosphere();
            let start = self.pos();
            let Some(c) = self.peek() else { break };
            let kind = match c {
                '(' => {
                    self.bump();
                    TokenKind::LParen
                }
                ')' => {
                    self.bump();
                    TokenKind::RParen
                }
                '\'' => {
                    self.bump();
                    TokenKind::Quote
                }
                '`' => {
                    self.bump();
                    TokenKind::Backquote
                }
                ',' => {
                    self.bump();
                    if self.peek() == Some('@') {
                        self.bump();
                        TokenKind::CommaAt
                    } else {
                        TokenKind::Comma
                    }
                }
                '"' => self.scan_string(),
                '|' => self.scan_pipe_symbol(),
                '#' => self.scan_hash(),
                _ => self.scan_atom(),
            };
            tokens.push(Token { kind, pos: start });
        }
        tokens
    }

    fn scan_string(&mut self) -> TokenKind {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return TokenKind::UnterminatedString,
                Some('"') => return TokenKind::Str(s),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some(other) => s.push(other),
                    None => return TokenKind::UnterminatedString,
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn scan_pipe_symbol(&mut self) -> TokenKind {
        self.bump(); // opening pipe
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return TokenKind::UnterminatedPipeSymbol,
                Some('|') => return TokenKind::PipeSymbol(s),
                Some(c) => s.push(c),
            }
        }
    }

    fn scan_hash(&mut self) -> TokenKind {
        self.bump(); // '#'
        match self.peek() {
            Some('(') => {
                self.bump();
                TokenKind::HashLParen
            }
            Some('t') => {
                self.bump();
                TokenKind::HashBool(true)
            }
            Some('f') => {
                self.bump();
                TokenKind::HashBool(false)
            }
            Some('\\') => {
                self.bump();
                let mut s = String::new();
                match self.bump() {
                    None => return TokenKind::UnterminatedChar,
                    Some(c) => s.push(c),
                }
                // Consume any following alphanumeric characters as part of a
                // named or hex-escaped character (e.g. `space`, `x41`).
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::HashChar(s)
            }
            _ => {
                let mut s = String::from("#");
                while let Some(c) = self.peek() {
                    if is_delimiter(c) {
                        break;
                    }
                    s.push(c);
                    self.bump();
                }
                TokenKind::Atom(s)
            }
        }
    }

    fn scan_atom(&mut self) -> TokenKind {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            s.push(c);
            self.bump();
        }
        TokenKind::Atom(s)
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '\'' | '`' | ',' | '|')
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    quote_ctx: Vec<QuoteContext>,
    pub diagnostics: Diagnostics,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let tokens = Tokenizer::new(source).tokenize();
        Parser {
            tokens,
            pos: 0,
            quote_ctx: vec![QuoteContext::Normal],
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn parse(mut self) -> Result<Program, Diagnostics> {
        let mut program = Program::new();
        while !self.is_at_end() {
            match self.parse_expr() {
                Some(e) => program.exprs.push(e),
                None => self.recover_to_top_level(),
            }
        }
        if self.diagnostics.is_empty() {
            Ok(program)
        } else {
            Err(self.diagnostics)
        }
    }

    /// Skip to just past the current top-level form after an error, so one
    /// malformed expression doesn't suppress diagnostics for the rest of
    /// the file.
    fn recover_to_top_level(&mut self) {
        if self.is_at_end() {
            return;
        }
        self.advance();
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check_rparen(&self) -> bool {
        matches!(self.current().map(|t| &t.kind), Some(TokenKind::RParen))
    }

    fn err(&mut self, pos: Pos, kind: Kind) {
        self.diagnostics.push(pos, kind);
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        let token = self.advance()?;
        let pos = token.pos;
        match token.kind {
            TokenKind::LParen => self.parse_list(pos),
            TokenKind::HashLParen => self.parse_vector(pos),
            TokenKind::RParen => {
                self.err(pos, Kind::UnmatchedRightParen);
                None
            }
            TokenKind::Quote => self.parse_quote_form(pos, "quote", QuoteContext::Quote),
            TokenKind::Backquote => {
                self.parse_quote_form(pos, "quasiquote", QuoteContext::QuasiQuote)
            }
            TokenKind::Comma => {
                if *self.quote_ctx.last().unwrap() == QuoteContext::Normal {
                    self.err(pos, Kind::UnquoteOutsideQuote);
                    return None;
                }
                self.parse_quote_form(pos, "unquote", QuoteContext::Normal)
            }
            TokenKind::CommaAt => {
                if *self.quote_ctx.last().unwrap() == QuoteContext::Normal {
                    self.err(pos, Kind::SplicingOutsideQuote);
                    return None;
                }
                self.parse_quote_form(pos, "unquote-splicing", QuoteContext::Normal)
            }
            TokenKind::Str(s) => Some(Expr::Str(SchemeString::new(s), pos)),
            TokenKind::PipeSymbol(s) => Some(Expr::Symbol(s, pos)),
            TokenKind::HashBool(b) => Some(Expr::Boolean(b, pos)),
            TokenKind::HashChar(spec) => self.parse_char_spec(&spec, pos),
            TokenKind::Atom(a) => Some(self.parse_atom(&a, pos)),
            TokenKind::UnterminatedString => {
                self.err(pos, Kind::UnexpectedEofInString);
                None
            }
            TokenKind::UnterminatedPipeSymbol => {
                self.err(pos, Kind::UnexpectedEofInPipeSymbol);
                None
            }
            TokenKind::UnterminatedChar => {
                self.err(pos, Kind::UnexpectedEofInCharacter);
                None
            }
        }
    }

    fn parse_quote_form(&mut self, pos: Pos, keyword: &str, ctx: QuoteContext) -> Option<Expr> {
        self.quote_ctx.push(ctx);
        if self.is_at_end() {
            self.err(pos, Kind::UnexpectedEofInQuote);
            self.quote_ctx.pop();
            return None;
        }
        let inner = self.parse_expr();
        self.quote_ctx.pop();
        let inner = inner?;
        Some(Expr::List(
            vec![Expr::Symbol(keyword.to_string(), pos), inner],
            pos,
        ))
    }

    fn parse_list(&mut self, start: Pos) -> Option<Expr> {
        let mut items = Vec::new();
        loop {
            if self.is_at_end() {
                self.err(start, Kind::UnexpectedEofInList);
                return None;
            }
            if self.check_rparen() {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
        }
        if items.is_empty() {
            self.err(start, Kind::EmptyList);
            return None;
        }
        Some(Expr::List(items, start))
    }

    fn parse_vector(&mut self, start: Pos) -> Option<Expr> {
        let mut items = Vec::new();
        loop {
            if self.is_at_end() {
                self.err(start, Kind::UnexpectedEofInVector);
                return None;
            }
            if self.check_rparen() {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
        }
        Some(Expr::Vector(items, start))
    }

    fn parse_char_spec(&mut self, spec: &str, pos: Pos) -> Option<Expr> {
        if spec.is_empty() {
            self.err(pos, Kind::UnexpectedEofInCharacter);
            return None;
        }
        // Single character, not followed by more input: `#\a`.
        if spec.chars().count() == 1 {
            let c = spec.chars().next().unwrap();
            return Some(char_to_expr(c as u32, pos));
        }
        // Hex escape: `#\xNN`.
        if let Some(hex) = spec.strip_prefix('x') {
            if let Ok(code) = u32::from_str_radix(hex, 16) {
                return Some(char_to_expr(code, pos));
            }
        }
        // Named character.
        if let Some(code) = named_char(spec) {
            return Some(char_to_expr(code, pos));
        }
        self.err(pos, Kind::MalformedCharacterName(spec.to_string()));
        None
    }

    fn parse_atom(&mut self, atom: &str, pos: Pos) -> Expr {
        if atom == "()" {
            return Expr::Null(pos);
        }
        if let Some(n) = parse_fixnum(atom) {
            return Expr::Fixnum(n, pos);
        }
        Expr::Symbol(atom.to_string(), pos)
    }
}

fn char_to_expr(code_point: u32, pos: Pos) -> Expr {
    if code_point <= 0x7F {
        Expr::AsciiChar(code_point as u8, pos)
    } else {
        Expr::UnicodeChar(code_point, pos)
    }
}

fn named_char(name: &str) -> Option<u32> {
    Some(match name {
        "alarm" => 7,
        "backspace" => 8,
        "delete" => 127,
        "escape" => 27,
        "newline" => 10,
        "null" => 0,
        "return" => 13,
        "space" => 32,
        "tab" => 9,
        _ => return None,
    })
}

/// A number matches `[+-]?[0-9]+`, with a leading sign only when followed
/// by a digit; otherwise the token is a symbol (e.g. `+`, `-`, `->foo`).
fn parse_fixnum(token: &str) -> Option<i64> {
    let bytes = token.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let (sign_consumed, digits_start) = match bytes[0] {
        b'+' | b'-' => (true, 1),
        _ => (false, 0),
    };
    if sign_consumed && (bytes.len() == 1 || !bytes[1].is_ascii_digit()) {
        return None;
    }
    if bytes.len() > digits_start && bytes[digits_start..].iter().all(|b| b.is_ascii_digit()) {
        token.parse::<i64>().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        Parser::new(src).parse().expect("expected successful parse")
    }

    #[test]
    fn parses_fixnum_literal() {
        let p = parse_ok("42");
        assert_eq!(p.exprs, vec![Expr::Fixnum(42, Pos::new(0, 0))]);
    }

    #[test]
    fn parses_negative_fixnum() {
        let p = parse_ok("-17");
        assert_eq!(p.exprs[0], Expr::Fixnum(-17, Pos::new(0, 0)));
    }

    #[test]
    fn leading_sign_without_digit_is_symbol() {
        let p = parse_ok("+");
        assert_eq!(p.exprs[0], Expr::Symbol("+".to_string(), Pos::new(0, 0)));
    }

    #[test]
    fn parses_booleans_and_nil() {
        let p = parse_ok("#t #f ()");
        assert_eq!(p.exprs[0], Expr::Boolean(true, Pos::new(0, 0)));
        assert_eq!(p.exprs[1], Expr::Boolean(false, Pos::new(0, 3)));
        assert!(matches!(p.exprs[2], Expr::Null(_)));
    }

    #[test]
    fn parses_nested_list() {
        let p = parse_ok("(+ 1 2 3 4)");
        match &p.exprs[0] {
            Expr::List(items, _) => {
                assert_eq!(items.len(), 5);
                assert_eq!(items[0].as_symbol(), Some("+"));
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn parses_vector() {
        let p = parse_ok("#(1 2 3)");
        match &p.exprs[0] {
            Expr::Vector(items, _) => assert_eq!(items.len(), 3),
            _ => panic!("expected vector"),
        }
    }

    #[test]
    fn parses_ascii_and_unicode_chars() {
        let p = parse_ok("#\\a #\\x3c0 #\\space");
        assert_eq!(p.exprs[0], Expr::AsciiChar(b'a', Pos::new(0, 0)));
        assert_eq!(p.exprs[1], Expr::UnicodeChar(0x3c0, Pos::new(0, 5)));
        assert_eq!(p.exprs[2], Expr::AsciiChar(32, Pos::new(0, 12)));
    }

    #[test]
    fn parses_quote_and_quasiquote() {
        let p = parse_ok("'a `b");
        assert_eq!(p.exprs[0].head_symbol(), Some("quote"));
        assert_eq!(p.exprs[1].head_symbol(), Some("quasiquote"));
    }

    #[test]
    fn unquote_inside_quasiquote_is_legal() {
        let p = parse_ok("`(a ,b ,@c)");
        let list = p.exprs[0].as_list().unwrap();
        assert_eq!(list[0].as_symbol(), Some("quasiquote"));
    }

    #[test]
    fn unquote_outside_quote_is_an_error() {
        let result = Parser::new(",a").parse();
        assert!(result.is_err());
    }

    #[test]
    fn unmatched_right_paren_is_an_error() {
        let result = Parser::new(")").parse();
        assert!(result.is_err());
    }

    #[test]
    fn unexpected_eof_in_string_is_an_error() {
        let result = Parser::new("\"abc").parse();
        assert!(result.is_err());
    }

    #[test]
    fn unexpected_eof_in_list_is_an_error() {
        let result = Parser::new("(+ 1 2").parse();
        assert!(result.is_err());
    }

    #[test]
    fn misspelled_character_name_is_an_error() {
        let result = Parser::new("#\\bogus").parse();
        assert!(result.is_err());
    }

    #[test]
    fn strings_and_pipe_symbols_roundtrip() {
        let p = parse_ok("\"ascii\" \"utf-8 \u{03c0}\" |weird sym|");
        match &p.exprs[0] {
            Expr::Str(s, _) => {
                assert!(!s.is_utf8);
                assert_eq!(s.len(), 5);
            }
            _ => panic!("expected string"),
        }
        match &p.exprs[1] {
            Expr::Str(s, _) => assert!(s.is_utf8),
            _ => panic!("expected string"),
        }
        match &p.exprs[2] {
            Expr::Symbol(s, _) => assert_eq!(s, "weird sym"),
            _ => panic!("expected symbol"),
        }
    }
}
