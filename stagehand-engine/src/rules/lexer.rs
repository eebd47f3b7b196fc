// Rule Expression Lexer
// Tokenizes `if:` conditions: $VAR, ${VAR}, strings, null, /regex/ and operators

use crate::rules::ExpressionError;

use std::fmt;

/// Token types for rule conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Variable(String),
    String(String),
    /// Pattern and whether the `i` flag was given
    Regex(String, bool),
    Null,

    Eq,       // ==
    Ne,       // !=
    Match,    // =~
    NotMatch, // !~
    And,      // &&
    Or,       // ||
    Not,      // !

    LParen,
    RParen,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Variable(name) => write!(f, "${}", name),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Regex(pattern, true) => write!(f, "/{}/i", pattern),
            Token::Regex(pattern, false) => write!(f, "/{}/", pattern),
            Token::Null => write!(f, "null"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Match => write!(f, "=~"),
            Token::NotMatch => write!(f, "!~"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// A token and the byte offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Lexer for rule conditions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            len: input.len(),
        }
    }

    /// Tokenize the entire input, ending with `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, ExpressionError> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let Some((pos, ch)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.len,
            });
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '=' => match self.chars.next() {
                Some((_, '=')) => Token::Eq,
                Some((_, '~')) => Token::Match,
                _ => return Err(ExpressionError::new("expected '==' or '=~'", pos)),
            },
            '!' => match self.chars.peek() {
                Some((_, '=')) => {
                    self.chars.next();
                    Token::Ne
                }
                Some((_, '~')) => {
                    self.chars.next();
                    Token::NotMatch
                }
                _ => Token::Not,
            },
            '&' => match self.chars.next() {
                Some((_, '&')) => Token::And,
                _ => return Err(ExpressionError::new("expected '&&'", pos)),
            },
            '|' => match self.chars.next() {
                Some((_, '|')) => Token::Or,
                _ => return Err(ExpressionError::new("expected '||'", pos)),
            },
            '$' => self.read_variable(pos)?,
            '"' | '\'' => Token::String(self.read_string(ch, pos)?),
            '/' => self.read_regex(pos)?,
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_alphanumeric()) {
                    word.push(c);
                }
                if word == "null" {
                    Token::Null
                } else {
                    return Err(ExpressionError::new(
                        format!("unexpected word '{}', variables start with '$'", word),
                        pos,
                    ));
                }
            }
            other => {
                return Err(ExpressionError::new(
                    format!("unexpected character '{}'", other),
                    pos,
                ))
            }
        };

        Ok(Spanned {
            token,
            position: pos,
        })
    }

    fn read_variable(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let braced = self.chars.next_if(|(_, c)| *c == '{').is_some();
        let mut name = String::new();
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        {
            name.push(c);
        }
        if braced && self.chars.next_if(|(_, c)| *c == '}').is_none() {
            return Err(ExpressionError::new("unterminated '${'", start));
        }
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(ExpressionError::new("invalid variable name", start));
        }
        Ok(Token::Variable(name))
    }

    fn read_string(&mut self, quote: char, start: usize) -> Result<String, ExpressionError> {
        let mut value = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                c if c == quote => return Ok(value),
                c => value.push(c),
            }
        }
        Err(ExpressionError::new("unterminated string", start))
    }

    fn read_regex(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let mut pattern = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\\')) => match self.chars.next() {
                    // `\/` is an escaped delimiter, other escapes belong to the regex
                    Some((_, '/')) => pattern.push('/'),
                    Some((_, c)) => {
                        pattern.push('\\');
                        pattern.push(c);
                    }
                    None => break,
                },
                Some((_, '/')) => {
                    let case_insensitive = self.chars.next_if(|(_, c)| *c == 'i').is_some();
                    return Ok(Token::Regex(pattern, case_insensitive));
                }
                Some((_, c)) => pattern.push(c),
                None => break,
            }
        }
        Err(ExpressionError::new("unterminated regular expression", start))
    }
}
