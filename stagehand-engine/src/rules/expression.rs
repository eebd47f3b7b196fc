// Rule Expression Parser
// Compiles `if:` conditions into predicates by recursive descent

use crate::rules::lexer::{Lexer, Spanned, Token};
use crate::rules::predicate::{CompareOp, Operand, Predicate};

use regex::RegexBuilder;
use thiserror::Error;

/// Syntax error in a rule condition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at position {position}")]
pub struct ExpressionError {
    pub message: String,
    pub position: usize,
}

impl ExpressionError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Compile an `if:` condition into a predicate
pub fn compile(input: &str) -> Result<Predicate, ExpressionError> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = ExprParser::new(tokens);
    parser.parse()
}

/// Recursive descent parser over rule tokens
pub struct ExprParser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Predicate, ExpressionError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty condition"));
        }
        let predicate = self.parse_or()?;
        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected {}", self.peek())));
        }
        Ok(predicate)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Unary: !
    // 4. Comparison: == != =~ !~

    fn parse_or(&mut self) -> Result<Predicate, ExpressionError> {
        let mut branches = vec![self.parse_and()?];
        while self.check(&Token::Or) {
            self.advance();
            branches.push(self.parse_and()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Predicate::Any(branches)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate, ExpressionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.check(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(Predicate::all(terms))
    }

    fn parse_unary(&mut self) -> Result<Predicate, ExpressionError> {
        if self.check(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, ExpressionError> {
        if self.check(&Token::LParen) {
            self.advance();
            let inner = self.parse_or()?;
            if !self.check(&Token::RParen) {
                return Err(self.error("expected ')'"));
            }
            self.advance();
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        match self.peek().clone() {
            Token::Eq | Token::Ne => {
                let op = if self.check(&Token::Eq) {
                    CompareOp::Eq
                } else {
                    CompareOp::Ne
                };
                self.advance();
                let right = self.parse_operand()?;
                Ok(Predicate::Compare { left, op, right })
            }
            Token::Match | Token::NotMatch => {
                let negate = self.check(&Token::NotMatch);
                self.advance();
                let position = self.current_position();
                let Token::Regex(pattern, case_insensitive) = self.peek().clone() else {
                    return Err(self.error("expected a /regex/ after '=~' or '!~'"));
                };
                self.advance();
                let pattern = RegexBuilder::new(&pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|e| ExpressionError::new(format!("invalid regex: {}", e), position))?;
                Ok(Predicate::Matches {
                    operand: left,
                    pattern,
                    negate,
                })
            }
            _ => match left {
                Operand::Variable(name) => Ok(Predicate::Defined(name)),
                _ => Err(self.error("a literal on its own is not a condition")),
            },
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ExpressionError> {
        let operand = match self.peek() {
            Token::Variable(name) => Operand::Variable(name.clone()),
            Token::String(value) => Operand::Literal(value.clone()),
            Token::Null => Operand::Null,
            other => return Err(self.error(&format!("expected a value, found {}", other))),
        };
        self.advance();
        Ok(operand)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::new(message, self.current_position())
    }
}
