//! Message selectors: a small SQL-like filter over headers and properties.
//!
//! Supported: `=`, `<>`, `<`, `>`, `<=`, `>=`, `AND`, `OR`, `NOT`,
//! parentheses, string (`'it''s'`), numeric and boolean literals, and
//! `IS [NOT] NULL`. Keywords are case-insensitive. Comparisons involving a
//! missing property or mismatched types are unknown, and a message is
//! selected only when the whole expression is true.

use crate::error::{JmsError, Result};
use crate::message::{DeliveryMode, Message};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    Is,
    Null,
    Bool(bool),
    Str(String),
    Num(f64),
    Ident(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Bool(bool),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Literal),
    Ident(String),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    IsNull { operand: Box<Expr>, negated: bool },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: String| JmsError::InvalidSelector {
            selector: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("selector is empty".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or().map_err(invalid)?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected {:?} after expression", token)));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.expr, message) == Some(true)
    }
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('<', Some('>')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => (CmpOp::Gt, 1),
                };
                tokens.push(Token::Cmp(op));
                i += width;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && starts_number(&chars, i + 1)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Bool(true),
                    "FALSE" => Token::Bool(false),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn starts_number(chars: &[char], i: usize) -> bool {
    chars.get(i).is_some_and(|c| c.is_ascii_digit() || *c == '.')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> ParseResult {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> ParseResult {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> ParseResult {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult {
        let left = self.primary()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                Ok(Expr::Compare(op, Box::new(left), Box::new(self.primary()?)))
            }
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                if !self.eat(&Token::Null) {
                    return Err("expected NULL after IS".into());
                }
                Ok(Expr::IsNull {
                    operand: Box::new(left),
                    negated,
                })
            }
            _ => Ok(left),
        }
    }

    fn primary(&mut self) -> ParseResult {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err("missing closing parenthesis".into());
                }
                Ok(inner)
            }
            Some(Token::Bool(b)) => Ok(Expr::Literal(Literal::Bool(b))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Literal::Num(n))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(other) => Err(format!("unexpected {:?}", other)),
            None => Err("unexpected end of selector".into()),
        }
    }
}

/// Resolve an identifier against the message headers, then its properties.
fn lookup(name: &str, message: &Message) -> Option<Literal> {
    match name {
        "JMSMessageID" => return Some(Literal::Str(message.id.clone())),
        "JMSCorrelationID" => return message.correlation_id.clone().map(Literal::Str),
        "JMSType" => return message.message_type.clone().map(Literal::Str),
        "JMSPriority" => return Some(Literal::Num(f64::from(message.priority))),
        "JMSTimestamp" => return Some(Literal::Num(message.timestamp.timestamp_millis() as f64)),
        "JMSDeliveryMode" => {
            let mode = match message.delivery_mode {
                DeliveryMode::Persistent => "PERSISTENT",
                DeliveryMode::NonPersistent => "NON_PERSISTENT",
            };
            return Some(Literal::Str(mode.to_string()));
        }
        _ => {}
    }
    match message.properties.get(name)? {
        Value::Bool(b) => Some(Literal::Bool(*b)),
        Value::Number(n) => n.as_f64().map(Literal::Num),
        Value::String(s) => Some(Literal::Str(s.clone())),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn value(expr: &Expr, message: &Message) -> Option<Literal> {
    match expr {
        Expr::Literal(literal) => Some(literal.clone()),
        Expr::Ident(name) => lookup(name, message),
        other => eval(other, message).map(Literal::Bool),
    }
}

/// Three-valued evaluation; `None` is SQL unknown.
fn eval(expr: &Expr, message: &Message) -> Option<bool> {
    match expr {
        Expr::Literal(Literal::Bool(b)) => Some(*b),
        Expr::Literal(_) => None,
        Expr::Ident(name) => match lookup(name, message)? {
            Literal::Bool(b) => Some(b),
            _ => None,
        },
        Expr::Compare(op, left, right) => {
            let ordering = match (value(left, message)?, value(right, message)?) {
                (Literal::Num(a), Literal::Num(b)) => a.partial_cmp(&b)?,
                (Literal::Str(a), Literal::Str(b)) => {
                    if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                        return None;
                    }
                    a.cmp(&b)
                }
                (Literal::Bool(a), Literal::Bool(b)) => {
                    if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                        return None;
                    }
                    a.cmp(&b)
                }
                _ => return None,
            };
            Some(match op {
                CmpOp::Eq => ordering == Ordering::Equal,
                CmpOp::Ne => ordering != Ordering::Equal,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
            })
        }
        Expr::IsNull { operand, negated } => {
            let is_null = value(operand, message).is_none();
            Some(is_null != *negated)
        }
        Expr::And(left, right) => match (eval(left, message), eval(right, message)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(left, right) => match (eval(left, message), eval(right, message)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => eval(inner, message).map(|b| !b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        let mut message = Message::new("body")
            .with_property("flag", true)
            .with_property("count", 5)
            .with_property("region", "eu-west");
        message.correlation_id = Some("abc".into());
        message
    }

    fn selects(selector: &str) -> bool {
        Selector::parse(selector).unwrap().matches(&message())
    }

    #[test]
    fn test_equality_on_booleans() {
        assert!(selects("flag=true"));
        assert!(!selects("flag=false"));
        assert!(selects("flag <> FALSE"));
        assert!(selects("flag"));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(selects("count > 4 AND count <= 5"));
        assert!(!selects("count < 5"));
        assert!(selects("count >= -1.5"));
        assert!(selects("JMSPriority = 4"));
    }

    #[test]
    fn test_strings_and_headers() {
        assert!(selects("region = 'eu-west'"));
        assert!(selects("JMSCorrelationID = 'abc'"));
        assert!(!selects("region = 'it''s'"));
        assert!(selects("JMSDeliveryMode = 'PERSISTENT'"));
    }

    #[test]
    fn test_logic_and_parentheses() {
        assert!(selects("NOT (count = 1 OR region = 'us')"));
        assert!(selects("count = 1 OR (flag AND region = 'eu-west')"));
        assert!(!selects("not flag"));
    }

    #[test]
    fn test_missing_property_is_unknown() {
        assert!(!selects("missing = 1"));
        assert!(!selects("NOT missing = 1"));
        assert!(selects("missing IS NULL"));
        assert!(selects("count IS NOT NULL"));
        assert!(selects("missing = 1 OR flag"));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(!selects("region = 5"));
        assert!(!selects("region <> 5"));
        assert!(!selects("region > 'a'"));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "flag =", "(flag", "count > > 1", "region = 'open", "a IS 1", "#"] {
            let err = Selector::parse(bad).unwrap_err();
            assert!(matches!(err, JmsError::InvalidSelector { .. }), "{bad}");
        }
    }
}
