//! Tokenizer for the filter language.

use std::fmt;

use crate::query::errors::ParseError;

/// Token kinds. Keywords stay identifiers; the parser matches them
/// case-insensitively.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Eq,        // =
    Lt,        // <
    Lte,       // <=
    Gt,        // >
    Gte,       // >=
    AndAnd,    // &&
    OrOr,      // ||
    LParen,    // (
    RParen,    // )
    Comma,     // ,
    Star,      // *
}

impl Token {
    /// Whether this is the identifier `kw`, ignoring case.
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Float(v) => write!(f, "{v:?}"),
            Token::Eq => write!(f, "="),
            Token::Lt => write!(f, "<"),
            Token::Lte => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Gte => write!(f, ">="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Star => write!(f, "*"),
        }
    }
}

/// Token with the byte offset it starts at.
#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Byte offset of its first character.
    pub offset: usize,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

/// Splits `input` into tokens.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut lexer = Lexer {
        input,
        chars: input.char_indices().peekable(),
    };
    let mut out = Vec::new();
    while let Some(spanned) = lexer.next_token()? {
        out.push(spanned);
    }
    Ok(out)
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    fn position(&mut self) -> usize {
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.input.len())
    }

    fn next_token(&mut self) -> Result<Option<Spanned>, ParseError> {
        while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
        let Some((offset, ch)) = self.chars.peek().copied() else {
            return Ok(None);
        };
        let token = match ch {
            '\'' | '"' => self.string(offset, ch)?,
            '0'..='9' => self.number(offset)?,
            '.' if matches!(self.peek_second(), Some('0'..='9')) => self.number(offset)?,
            '-' if matches!(self.peek_second(), Some('0'..='9' | '.')) => self.number(offset)?,
            c if is_ident_start(c) => self.ident(),
            '=' => self.single(Token::Eq),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            ',' => self.single(Token::Comma),
            '*' => self.single(Token::Star),
            '<' => self.with_eq(Token::Lt, Token::Lte),
            '>' => self.with_eq(Token::Gt, Token::Gte),
            '&' => self.pair('&', Token::AndAnd, offset)?,
            '|' => self.pair('|', Token::OrOr, offset)?,
            other => return Err(ParseError::UnexpectedChar { offset, ch: other }),
        };
        Ok(Some(Spanned { token, offset }))
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn with_eq(&mut self, plain: Token, with_eq: Token) -> Token {
        self.chars.next();
        if self.peek_char() == Some('=') {
            self.chars.next();
            with_eq
        } else {
            plain
        }
    }

    fn pair(&mut self, ch: char, token: Token, offset: usize) -> Result<Token, ParseError> {
        self.chars.next();
        if self.peek_char() == Some(ch) {
            self.chars.next();
            Ok(token)
        } else {
            Err(ParseError::UnexpectedChar { offset, ch })
        }
    }

    fn ident(&mut self) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek_char() {
            if !is_ident_continue(c) {
                break;
            }
            name.push(c);
            self.chars.next();
        }
        Token::Ident(name)
    }

    fn string(&mut self, offset: usize, quote: char) -> Result<Token, ParseError> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                None => return Err(ParseError::UnterminatedString { offset }),
                Some((_, c)) if c == quote => return Ok(Token::Str(text)),
                Some((at, '\\')) => match self.chars.next() {
                    Some((_, c @ ('\'' | '"' | '\\'))) => text.push(c),
                    Some((_, c)) => return Err(ParseError::InvalidEscape { offset: at, ch: c }),
                    None => return Err(ParseError::UnterminatedString { offset }),
                },
                Some((_, c)) => text.push(c),
            }
        }
    }

    fn number(&mut self, offset: usize) -> Result<Token, ParseError> {
        let mut text = String::new();
        let mut is_float = false;
        if self.peek_char() == Some('-') {
            text.push('-');
            self.chars.next();
        }
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => text.push(c),
                '.' if !is_float => {
                    is_float = true;
                    text.push(c);
                }
                'e' | 'E' => {
                    is_float = true;
                    text.push(c);
                    self.chars.next();
                    if let Some(sign @ ('+' | '-')) = self.peek_char() {
                        text.push(sign);
                        self.chars.next();
                    }
                    continue;
                }
                _ => break,
            }
            self.chars.next();
        }
        let invalid = || ParseError::InvalidNumber {
            offset,
            text: text.clone(),
        };
        if is_float {
            let value: f64 = text.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            Ok(Token::Float(value))
        } else {
            text.parse().map(Token::Int).map_err(|_| invalid())
        }
    }
}
