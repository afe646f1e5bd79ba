use std::{iter::Peekable, str::Chars};

use strata_core::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),

    Let,
    Fn,
    Class,
    Return,
    Raise,
    If,
    Else,
    For,
    In,
    True,
    False,
    Null,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,

    Eof,
}

impl TokenKind {
    fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "let" => TokenKind::Let,
            "fn" => TokenKind::Fn,
            "class" => TokenKind::Class,
            "return" => TokenKind::Return,
            "raise" => TokenKind::Raise,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ScriptError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(c) = self.chars.next() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                });
                return Ok(tokens);
            };

            let kind = match c {
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                '[' => TokenKind::LBracket,
                ']' => TokenKind::RBracket,
                ',' => TokenKind::Comma,
                '.' => TokenKind::Dot,
                ':' => TokenKind::Colon,
                ';' => TokenKind::Semicolon,
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '%' => TokenKind::Percent,
                '=' => self.pick('=', TokenKind::EqEq, TokenKind::Assign),
                '!' => self.pick('=', TokenKind::NotEq, TokenKind::Bang),
                '<' => self.pick('=', TokenKind::Le, TokenKind::Lt),
                '>' => self.pick('=', TokenKind::Ge, TokenKind::Gt),
                '&' => self.pair('&', TokenKind::AndAnd, line)?,
                '|' => self.pair('|', TokenKind::OrOr, line)?,
                '"' => TokenKind::Str(self.string(line)?),
                c if c.is_ascii_digit() => self.number(c, line)?,
                c if c.is_alphabetic() || c == '_' => {
                    let ident = self.ident(c);
                    TokenKind::keyword(&ident).unwrap_or(TokenKind::Ident(ident))
                }
                other => {
                    return Err(ScriptError::syntax(format!(
                        "unexpected character {other:?} on line {line}"
                    )))
                }
            };
            tokens.push(Token { kind, line });
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.chars.next();
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                _ => break,
            }
        }
    }

    fn pick(&mut self, next: char, matched: TokenKind, otherwise: TokenKind) -> TokenKind {
        if self.chars.peek() == Some(&next) {
            self.chars.next();
            matched
        } else {
            otherwise
        }
    }

    fn pair(&mut self, next: char, kind: TokenKind, line: usize) -> Result<TokenKind, ScriptError> {
        if self.chars.next_if_eq(&next).is_some() {
            Ok(kind)
        } else {
            Err(ScriptError::syntax(format!(
                "expected '{next}{next}' on line {line}"
            )))
        }
    }

    fn string(&mut self, line: usize) -> Result<String, ScriptError> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => {
                    return Err(ScriptError::syntax(format!(
                        "unterminated string starting on line {line}"
                    )))
                }
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        return Err(ScriptError::syntax(format!(
                            "unknown escape '\\{other}' on line {}",
                            self.line
                        )))
                    }
                    None => continue,
                },
                Some('\n') => {
                    self.line += 1;
                    out.push('\n');
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: usize) -> Result<TokenKind, ScriptError> {
        let mut text = String::from(first);
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.chars.next();
            } else if c == '.' && !seen_dot && !seen_exp {
                // `1.foo` is not a number; only consume the dot before a digit.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if !matches!(lookahead.peek(), Some(d) if d.is_ascii_digit()) {
                    break;
                }
                seen_dot = true;
                text.push(c);
                self.chars.next();
            } else if (c == 'e' || c == 'E') && !seen_exp {
                seen_exp = true;
                text.push(c);
                self.chars.next();
                if let Some(sign) = self.chars.next_if(|s| *s == '+' || *s == '-') {
                    text.push(sign);
                }
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ScriptError::syntax(format!("invalid number {text:?} on line {line}")))
    }

    fn ident(&mut self, first: char) -> String {
        let mut ident = String::from(first);
        while let Some(c) = self.chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
            ident.push(c);
        }
        ident
    }
}
