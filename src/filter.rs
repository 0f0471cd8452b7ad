//! Filter Expressions
//!
//! A small jq-style expression language evaluated against one JSON value.
//! Subscriptions use it twice: a gate expression decides whether an event
//! is kept at all, and a summary expression projects the payload down to
//! something small enough to hand to a session.
//!
//! Supported syntax: identity (`.`), field/index paths (`.pr.title`,
//! `.items[0]`, `.commits[-1]`), `select(expr)`, object construction
//! (`{title: .pr.title, repo}`), JSON literals, `==`/`!=` comparisons,
//! and pipes. Evaluation is purely functional; a broken expression fails
//! that one call and nothing else.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("filter parse error: {0}")]
    Parse(String),
    #[error("filter eval error: {0}")]
    Eval(String),
}

/// Falsy exactly means boolean `false` or `null`. Everything else,
/// including `0`, `""`, and empty containers, passes a gate.
pub fn falsy(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(false))
}

/// Evaluate `expression` against `input`.
///
/// An empty result (a `select` whose condition did not hold) collapses to
/// `null`, which callers already treat as falsy.
pub fn evaluate(expression: &str, input: &Value) -> Result<Value, FilterError> {
    let expr = Parser::new(lex(expression)?).parse()?;
    Ok(eval(&expr, input)?.unwrap_or(Value::Null))
}

/// Projection used when a summary expression is absent or fails: the
/// sorted top-level field names for objects, `null` for anything else.
pub fn fallback_summary(input: &Value) -> Value {
    match input {
        Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            Value::Array(keys.into_iter().map(Value::String).collect())
        }
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Pipe,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
    Eq,
    Ne,
    Ident(String),
    Literal(Value),
}

fn lex(src: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::Eq);
                    }
                    _ => return Err(FilterError::Parse("single '=' (use '==')".into())),
                }
            }
            '!' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::Ne);
                    }
                    _ => return Err(FilterError::Parse("single '!' (use '!=')".into())),
                }
            }
            '"' => {
                chars.next();
                let mut escaped = false;
                let end = loop {
                    match chars.next() {
                        Some((i, '"')) if !escaped => break i,
                        Some((_, '\\')) if !escaped => escaped = true,
                        Some(_) => escaped = false,
                        None => return Err(FilterError::Parse("unterminated string".into())),
                    }
                };
                let text: String = serde_json::from_str(&src[start..=end])
                    .map_err(|e| FilterError::Parse(format!("bad string literal: {e}")))?;
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut end = start + c.len_utf8();
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-') {
                        chars.next();
                        end = i + c.len_utf8();
                    } else {
                        break;
                    }
                }
                let value: Value = serde_json::from_str(&src[start..end])
                    .map_err(|e| FilterError::Parse(format!("bad number: {e}")))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        chars.next();
                        end = i + c.len_utf8();
                    } else {
                        break;
                    }
                }
                tokens.push(match &src[start..end] {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    word => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(FilterError::Parse(format!("unexpected character {other:?}")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Field(String),
    Index(i64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Identity,
    Path(Vec<PathSeg>),
    Literal(Value),
    Select(Box<Expr>),
    /// Members with no value expression are shorthand: `{title}` reads
    /// `.title` from the input.
    Object(Vec<(String, Option<Expr>)>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Pipe(Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek2(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), FilterError> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            other => Err(FilterError::Parse(format!(
                "expected {want:?}, found {other:?}"
            ))),
        }
    }

    fn parse(mut self) -> Result<Expr, FilterError> {
        if self.tokens.is_empty() {
            return Err(FilterError::Parse("empty expression".into()));
        }
        let expr = self.parse_pipe()?;
        match self.peek() {
            None => Ok(expr),
            Some(t) => Err(FilterError::Parse(format!("trailing input at {t:?}"))),
        }
    }

    fn parse_pipe(&mut self) -> Result<Expr, FilterError> {
        let mut stages = vec![self.parse_term()?];
        while self.peek() == Some(&Token::Pipe) {
            self.bump();
            stages.push(self.parse_term()?);
        }
        if stages.len() == 1 {
            Ok(stages.pop().unwrap())
        } else {
            Ok(Expr::Pipe(stages))
        }
    }

    fn parse_term(&mut self) -> Result<Expr, FilterError> {
        match (self.peek(), self.peek2()) {
            (Some(Token::Ident(name)), Some(Token::LParen)) if name == "select" => {
                self.bump();
                self.bump();
                let cond = self.parse_pipe()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Select(Box::new(cond)))
            }
            (Some(Token::LBrace), _) => self.parse_object(),
            _ => {
                let lhs = self.parse_operand()?;
                let op = match self.peek() {
                    Some(Token::Eq) => CmpOp::Eq,
                    Some(Token::Ne) => CmpOp::Ne,
                    _ => return Ok(lhs),
                };
                self.bump();
                let rhs = self.parse_operand()?;
                Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)))
            }
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, FilterError> {
        match self.peek() {
            Some(Token::Dot) => self.parse_path(),
            Some(Token::Literal(_)) => match self.bump() {
                Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
                _ => unreachable!(),
            },
            other => Err(FilterError::Parse(format!(
                "expected path or literal, found {other:?}"
            ))),
        }
    }

    fn parse_path(&mut self) -> Result<Expr, FilterError> {
        self.expect(Token::Dot)?;
        let mut segs = Vec::new();

        if let Some(Token::Ident(_)) = self.peek() {
            if let Some(Token::Ident(name)) = self.bump() {
                segs.push(PathSeg::Field(name));
            }
        }

        loop {
            match (self.peek(), self.peek2()) {
                (Some(Token::Dot), Some(Token::Ident(_))) => {
                    self.bump();
                    if let Some(Token::Ident(name)) = self.bump() {
                        segs.push(PathSeg::Field(name));
                    }
                }
                (Some(Token::LBracket), _) => {
                    self.bump();
                    let index = match self.bump() {
                        Some(Token::Literal(Value::Number(n))) => n.as_i64().ok_or_else(|| {
                            FilterError::Parse(format!("non-integer index {n}"))
                        })?,
                        other => {
                            return Err(FilterError::Parse(format!(
                                "expected integer index, found {other:?}"
                            )))
                        }
                    };
                    self.expect(Token::RBracket)?;
                    segs.push(PathSeg::Index(index));
                }
                _ => break,
            }
        }

        if segs.is_empty() {
            Ok(Expr::Identity)
        } else {
            Ok(Expr::Path(segs))
        }
    }

    fn parse_object(&mut self) -> Result<Expr, FilterError> {
        self.expect(Token::LBrace)?;
        let mut members = Vec::new();

        if self.peek() == Some(&Token::RBrace) {
            self.bump();
            return Ok(Expr::Object(members));
        }

        loop {
            let key = match self.bump() {
                Some(Token::Ident(name)) => name,
                Some(Token::Literal(Value::String(name))) => name,
                other => {
                    return Err(FilterError::Parse(format!(
                        "expected object key, found {other:?}"
                    )))
                }
            };
            let value = if self.peek() == Some(&Token::Colon) {
                self.bump();
                Some(self.parse_pipe()?)
            } else {
                None
            };
            members.push((key, value));

            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => break,
                other => {
                    return Err(FilterError::Parse(format!(
                        "expected ',' or '}}', found {other:?}"
                    )))
                }
            }
        }

        Ok(Expr::Object(members))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// `None` is the empty result: a `select` that did not hold. It propagates
/// through pipes without ever being fed to a later stage.
fn eval(expr: &Expr, input: &Value) -> Result<Option<Value>, FilterError> {
    match expr {
        Expr::Identity => Ok(Some(input.clone())),
        Expr::Literal(v) => Ok(Some(v.clone())),
        Expr::Path(segs) => walk(segs, input).map(Some),
        Expr::Select(cond) => match eval(cond, input)? {
            None => Ok(None),
            Some(v) if falsy(&v) => Ok(None),
            Some(_) => Ok(Some(input.clone())),
        },
        Expr::Compare(lhs, op, rhs) => {
            let l = eval(lhs, input)?.unwrap_or(Value::Null);
            let r = eval(rhs, input)?.unwrap_or(Value::Null);
            let equal = l == r;
            Ok(Some(Value::Bool(match op {
                CmpOp::Eq => equal,
                CmpOp::Ne => !equal,
            })))
        }
        Expr::Object(members) => {
            let mut out = serde_json::Map::new();
            for (key, value) in members {
                let v = match value {
                    Some(expr) => eval(expr, input)?.unwrap_or(Value::Null),
                    None => walk(&[PathSeg::Field(key.clone())], input)?,
                };
                out.insert(key.clone(), v);
            }
            Ok(Some(Value::Object(out)))
        }
        Expr::Pipe(stages) => {
            let mut current = input.clone();
            for stage in stages {
                match eval(stage, &current)? {
                    Some(v) => current = v,
                    None => return Ok(None),
                }
            }
            Ok(Some(current))
        }
    }
}

fn walk(segs: &[PathSeg], input: &Value) -> Result<Value, FilterError> {
    let null = Value::Null;
    let mut current = input;

    for seg in segs {
        current = match (seg, current) {
            (PathSeg::Field(name), Value::Object(map)) => map.get(name).unwrap_or(&null),
            (PathSeg::Field(_), Value::Null) => &null,
            (PathSeg::Field(name), other) => {
                return Err(FilterError::Eval(format!(
                    "cannot index {} with \"{name}\"",
                    type_name(other)
                )));
            }
            (PathSeg::Index(i), Value::Array(items)) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                usize::try_from(idx)
                    .ok()
                    .and_then(|u| items.get(u))
                    .unwrap_or(&null)
            }
            (PathSeg::Index(_), Value::Null) => &null,
            (PathSeg::Index(i), other) => {
                return Err(FilterError::Eval(format!(
                    "cannot index {} with {i}",
                    type_name(other)
                )));
            }
        };
    }

    Ok(current.clone())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
