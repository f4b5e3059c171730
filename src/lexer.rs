//! Lexer for Lua 5.1 source
//!
//! Converts a byte sequence into a token stream terminated by an EOF
//! token. String values are byte strings: Lua string literals may contain
//! embedded NULs and arbitrary non-UTF-8 bytes via `\ddd` escapes.

use std::fmt;

use bstr::{BString, ByteSlice};

use crate::error::{lex_error, Result};

/// A Lua lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Caret,        // ^
    Hash,         // #
    Eq,           // ==
    NotEq,        // ~=
    LessEq,       // <=
    GreaterEq,    // >=
    Less,         // <
    Greater,      // >
    Assign,       // =
    Concat,       // ..
    Ellipsis,     // ...

    // Punctuation
    LeftParen,    // (
    RightParen,   // )
    LeftBrace,    // {
    RightBrace,   // }
    LeftBracket,  // [
    RightBracket, // ]
    Semicolon,    // ;
    Colon,        // :
    Comma,        // ,
    Dot,          // .

    // Literals
    Number(f64),
    String(BString),

    // Identifiers
    Name(String),

    // End of file
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => write!(f, "and"),
            Token::Break => write!(f, "break"),
            Token::Do => write!(f, "do"),
            Token::Else => write!(f, "else"),
            Token::ElseIf => write!(f, "elseif"),
            Token::End => write!(f, "end"),
            Token::False => write!(f, "false"),
            Token::For => write!(f, "for"),
            Token::Function => write!(f, "function"),
            Token::If => write!(f, "if"),
            Token::In => write!(f, "in"),
            Token::Local => write!(f, "local"),
            Token::Nil => write!(f, "nil"),
            Token::Not => write!(f, "not"),
            Token::Or => write!(f, "or"),
            Token::Repeat => write!(f, "repeat"),
            Token::Return => write!(f, "return"),
            Token::Then => write!(f, "then"),
            Token::True => write!(f, "true"),
            Token::Until => write!(f, "until"),
            Token::While => write!(f, "while"),

            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Caret => write!(f, "^"),
            Token::Hash => write!(f, "#"),
            Token::Eq => write!(f, "=="),
            Token::NotEq => write!(f, "~="),
            Token::LessEq => write!(f, "<="),
            Token::GreaterEq => write!(f, ">="),
            Token::Less => write!(f, "<"),
            Token::Greater => write!(f, ">"),
            Token::Assign => write!(f, "="),
            Token::Concat => write!(f, ".."),
            Token::Ellipsis => write!(f, "..."),

            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::LeftBrace => write!(f, "{{"),
            Token::RightBrace => write!(f, "}}"),
            Token::LeftBracket => write!(f, "["),
            Token::RightBracket => write!(f, "]"),
            Token::Semicolon => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),

            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "{:?}", s.as_bstr()),
            Token::Name(s) => write!(f, "{}", s),

            Token::Eof => write!(f, "<eof>"),
        }
    }
}

/// A token with its source location
#[derive(Debug, Clone)]
pub struct TokenWithLocation {
    /// The token itself
    pub token: Token,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

/// Lexer state over a source byte slice
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer
    pub fn new(src: &'a [u8]) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn current(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) {
        if let Some(b) = self.current() {
            self.pos += 1;
            if b == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(lex_error(message, self.line, self.column))
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.current() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(0x0B) | Some(0x0C) => {
                    self.advance();
                }
                Some(b'-') if self.peek() == Some(b'-') => {
                    self.advance();
                    self.advance();
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_bracket(level, "unfinished long comment")?;
                    } else {
                        while let Some(b) = self.current() {
                            if b == b'\n' {
                                break;
                            }
                            self.advance();
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// If the cursor sits on a `[=*[` opener, return its level without
    /// consuming anything.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.current() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.src.get(self.pos + 1 + level) == Some(&b'=') {
            level += 1;
        }
        if self.src.get(self.pos + 1 + level) == Some(&b'[') {
            Some(level)
        } else {
            None
        }
    }

    /// Read a `[=*[ ... ]=*]` bracketed body. The cursor must sit on the
    /// opening `[`; the matching closer must have the same level.
    fn read_long_bracket(&mut self, level: usize, unfinished: &str) -> Result<BString> {
        let start_line = self.line;
        let start_column = self.column;

        // Skip the opener
        for _ in 0..level + 2 {
            self.advance();
        }
        // A newline immediately following the opener is dropped
        if self.current() == Some(b'\r') {
            self.advance();
            if self.current() == Some(b'\n') {
                self.advance();
            }
        } else if self.current() == Some(b'\n') {
            self.advance();
        }

        let mut result = BString::from(Vec::new());
        loop {
            match self.current() {
                None => return Err(lex_error(unfinished, start_line, start_column)),
                Some(b']') => {
                    let mut count = 0;
                    while self.src.get(self.pos + 1 + count) == Some(&b'=') {
                        count += 1;
                    }
                    if count == level && self.src.get(self.pos + 1 + count) == Some(&b']') {
                        for _ in 0..level + 2 {
                            self.advance();
                        }
                        return Ok(result);
                    }
                    result.push(b']');
                    self.advance();
                }
                Some(b) => {
                    result.push(b);
                    self.advance();
                }
            }
        }
    }

    fn read_short_string(&mut self) -> Result<Token> {
        let delimiter = self.current().unwrap();
        let start_line = self.line;
        let start_column = self.column;
        self.advance();

        let mut result = BString::from(Vec::new());
        loop {
            match self.current() {
                None => return Err(lex_error("unfinished string", start_line, start_column)),
                Some(b) if b == delimiter => {
                    self.advance();
                    return Ok(Token::String(result));
                }
                Some(b'\n') => {
                    return Err(lex_error("unfinished string", start_line, start_column));
                }
                Some(b'\\') => {
                    self.advance();
                    match self.current() {
                        Some(b'a') => {
                            result.push(0x07);
                            self.advance();
                        }
                        Some(b'b') => {
                            result.push(0x08);
                            self.advance();
                        }
                        Some(b'f') => {
                            result.push(0x0C);
                            self.advance();
                        }
                        Some(b'n') => {
                            result.push(b'\n');
                            self.advance();
                        }
                        Some(b'r') => {
                            result.push(b'\r');
                            self.advance();
                        }
                        Some(b't') => {
                            result.push(b'\t');
                            self.advance();
                        }
                        Some(b'v') => {
                            result.push(0x0B);
                            self.advance();
                        }
                        Some(b'\\') => {
                            result.push(b'\\');
                            self.advance();
                        }
                        Some(b'"') => {
                            result.push(b'"');
                            self.advance();
                        }
                        Some(b'\'') => {
                            result.push(b'\'');
                            self.advance();
                        }
                        Some(b'\n') => {
                            result.push(b'\n');
                            self.advance();
                        }
                        Some(d) if d.is_ascii_digit() => {
                            // \ddd with 1-3 decimal digits, value <= 255
                            let mut value: u32 = 0;
                            for _ in 0..3 {
                                match self.current() {
                                    Some(d) if d.is_ascii_digit() => {
                                        value = value * 10 + u32::from(d - b'0');
                                        self.advance();
                                    }
                                    _ => break,
                                }
                            }
                            if value > 255 {
                                return self.error("decimal escape too large");
                            }
                            result.push(value as u8);
                        }
                        Some(c) => {
                            return self.error(format!(
                                "invalid escape sequence '\\{}'",
                                c as char
                            ));
                        }
                        None => {
                            return Err(lex_error(
                                "unfinished string",
                                start_line,
                                start_column,
                            ));
                        }
                    }
                }
                Some(b) => {
                    result.push(b);
                    self.advance();
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Token> {
        let line = self.line;
        let column = self.column;

        if self.current() == Some(b'0') && matches!(self.peek(), Some(b'x') | Some(b'X')) {
            self.advance();
            self.advance();
            let mut value: f64 = 0.0;
            let mut digits = 0;
            while let Some(d) = self.current() {
                if let Some(v) = (d as char).to_digit(16) {
                    value = value * 16.0 + f64::from(v);
                    digits += 1;
                    self.advance();
                } else {
                    break;
                }
            }
            if digits == 0 || self.trailing_junk() {
                return Err(lex_error("malformed number", line, column));
            }
            return Ok(Token::Number(value));
        }

        let start = self.pos;
        while let Some(b) = self.current() {
            if b.is_ascii_digit() || b == b'.' {
                self.advance();
            } else {
                break;
            }
        }
        if matches!(self.current(), Some(b'e') | Some(b'E')) {
            self.advance();
            if matches!(self.current(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            let mut digits = 0;
            while let Some(b) = self.current() {
                if b.is_ascii_digit() {
                    digits += 1;
                    self.advance();
                } else {
                    break;
                }
            }
            if digits == 0 {
                return Err(lex_error("malformed number", line, column));
            }
        }
        if self.trailing_junk() {
            return Err(lex_error("malformed number", line, column));
        }

        // The scanned range is ASCII by construction
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        match text.parse::<f64>() {
            Ok(n) => Ok(Token::Number(n)),
            Err(_) => Err(lex_error("malformed number", line, column)),
        }
    }

    /// A number immediately followed by an identifier character or another
    /// dot is malformed, as in the reference lexer ("1..2", "123abc").
    fn trailing_junk(&self) -> bool {
        matches!(self.current(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
    }

    fn read_name(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.current() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let name = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap()
            .to_string();

        match name.as_str() {
            "and" => Token::And,
            "break" => Token::Break,
            "do" => Token::Do,
            "else" => Token::Else,
            "elseif" => Token::ElseIf,
            "end" => Token::End,
            "false" => Token::False,
            "for" => Token::For,
            "function" => Token::Function,
            "if" => Token::If,
            "in" => Token::In,
            "local" => Token::Local,
            "nil" => Token::Nil,
            "not" => Token::Not,
            "or" => Token::Or,
            "repeat" => Token::Repeat,
            "return" => Token::Return,
            "then" => Token::Then,
            "true" => Token::True,
            "until" => Token::Until,
            "while" => Token::While,
            _ => Token::Name(name),
        }
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<TokenWithLocation> {
        self.skip_whitespace_and_comments()?;

        let line = self.line;
        let column = self.column;

        let b = match self.current() {
            None => {
                return Ok(TokenWithLocation {
                    token: Token::Eof,
                    line,
                    column,
                })
            }
            Some(b) => b,
        };

        let token = match b {
            b'+' => {
                self.advance();
                Token::Plus
            }
            b'-' => {
                self.advance();
                Token::Minus
            }
            b'*' => {
                self.advance();
                Token::Star
            }
            b'/' => {
                self.advance();
                Token::Slash
            }
            b'%' => {
                self.advance();
                Token::Percent
            }
            b'^' => {
                self.advance();
                Token::Caret
            }
            b'#' => {
                self.advance();
                Token::Hash
            }
            b'(' => {
                self.advance();
                Token::LeftParen
            }
            b')' => {
                self.advance();
                Token::RightParen
            }
            b'{' => {
                self.advance();
                Token::LeftBrace
            }
            b'}' => {
                self.advance();
                Token::RightBrace
            }
            b']' => {
                self.advance();
                Token::RightBracket
            }
            b';' => {
                self.advance();
                Token::Semicolon
            }
            b':' => {
                self.advance();
                Token::Colon
            }
            b',' => {
                self.advance();
                Token::Comma
            }
            b'[' => {
                if let Some(level) = self.long_bracket_level() {
                    Token::String(self.read_long_bracket(level, "unfinished long string")?)
                } else {
                    self.advance();
                    Token::LeftBracket
                }
            }
            b'=' => {
                self.advance();
                if self.current() == Some(b'=') {
                    self.advance();
                    Token::Eq
                } else {
                    Token::Assign
                }
            }
            b'~' => {
                self.advance();
                if self.current() == Some(b'=') {
                    self.advance();
                    Token::NotEq
                } else {
                    return Err(lex_error("unexpected symbol near '~'", line, column));
                }
            }
            b'<' => {
                self.advance();
                if self.current() == Some(b'=') {
                    self.advance();
                    Token::LessEq
                } else {
                    Token::Less
                }
            }
            b'>' => {
                self.advance();
                if self.current() == Some(b'=') {
                    self.advance();
                    Token::GreaterEq
                } else {
                    Token::Greater
                }
            }
            b'.' => {
                if matches!(self.peek(), Some(d) if d.is_ascii_digit()) {
                    self.read_number()?
                } else {
                    self.advance();
                    if self.current() == Some(b'.') {
                        self.advance();
                        if self.current() == Some(b'.') {
                            self.advance();
                            Token::Ellipsis
                        } else {
                            Token::Concat
                        }
                    } else {
                        Token::Dot
                    }
                }
            }
            b'"' | b'\'' => self.read_short_string()?,
            d if d.is_ascii_digit() => self.read_number()?,
            c if c.is_ascii_alphabetic() || c == b'_' => self.read_name(),
            c => {
                return Err(lex_error(
                    format!("unexpected symbol near '{}'", escape_byte(c)),
                    line,
                    column,
                ));
            }
        };

        Ok(TokenWithLocation {
            token,
            line,
            column,
        })
    }
}

fn escape_byte(b: u8) -> String {
    if b.is_ascii_graphic() {
        (b as char).to_string()
    } else {
        format!("\\{}", b)
    }
}

/// Tokenize a source byte sequence into a token vector terminated by EOF
pub fn tokenize(source: &[u8]) -> Result<Vec<TokenWithLocation>> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.token, Token::Eof);
        tokens.push(token);
        if is_eof {
            return Ok(tokens);
        }
    }
}
