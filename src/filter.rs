//! Sandboxed evaluation of hook filters.
//!
//! A filter is a single boolean expression over the binding `message`
//! (the event as a JSON object), e.g.
//! `message.payload.amount > 100 && message.originator == 'billing'`.
//!
//! The interpreter only understands a small expression grammar: literals,
//! member/index access on `message`, arithmetic, comparison, logical
//! operators and the `includes` / `startsWith` / `endsWith` methods. There
//! are no other identifiers, no assignment, no loops and no host functions,
//! so a filter cannot reach process state, the network or the filesystem.
//! Work is bounded by the expression length, the nesting depth of
//! parentheses and unary operators, and a step budget; [`FilterSandbox`] adds
//! a wall-clock timeout on top. Flat operator chains such as a long list of
//! `||` alternatives do not nest.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::telemetry::{metric_inc, FILTER_ERROR, FILTER_REJECTED};
use crate::types::Hook;

/// Maximum nesting of the parsed expression tree.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("filter is longer than {max} characters")]
    TooLong { max: usize },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("filter nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("type error: {0}")]
    Type(String),

    #[error("evaluation exceeded {0} steps")]
    BudgetExceeded(usize),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("evaluator panicked")]
    Panicked,
}

/// Pluggable filter evaluation strategy.
pub trait Evaluator: Send + Sync {
    /// Evaluate `expression` with `message` bound to the event.
    fn run(&self, expression: &str, message: &Value) -> Result<bool, FilterError>;

    /// Reject expressions that can never evaluate. Called when a hook is saved.
    fn check(&self, expression: &str) -> Result<(), FilterError> {
        let _ = expression;
        Ok(())
    }
}

/// The built-in restricted expression interpreter.
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    max_length: usize,
    max_steps: usize,
}

impl ExpressionEvaluator {
    pub fn new(max_length: usize, max_steps: usize) -> Self {
        Self {
            max_length,
            max_steps: max_steps.max(1),
        }
    }

    fn compile(&self, expression: &str) -> Result<Expr, FilterError> {
        if expression.chars().count() > self.max_length {
            return Err(FilterError::TooLong {
                max: self.max_length,
            });
        }
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(FilterError::Syntax("empty expression".to_string()));
        }
        Parser::parse(tokens)
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self::new(config.filter_max_length, config.filter_max_steps)
    }
}

impl Evaluator for ExpressionEvaluator {
    fn run(&self, expression: &str, message: &Value) -> Result<bool, FilterError> {
        let expr = self.compile(expression)?;
        let mut interpreter = Interpreter {
            message,
            steps: 0,
            max_steps: self.max_steps,
        };
        Ok(interpreter.eval(&expr)?.truthy())
    }

    fn check(&self, expression: &str) -> Result<(), FilterError> {
        self.compile(expression).map(|_| ())
    }
}

/// Runs hook filters off the async executor, failing closed.
#[derive(Clone)]
pub struct FilterSandbox {
    evaluator: Arc<dyn Evaluator>,
    timeout: Duration,
}

impl FilterSandbox {
    pub fn new(evaluator: Arc<dyn Evaluator>, timeout: Duration) -> Self {
        Self { evaluator, timeout }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(ExpressionEvaluator::new(
                config.filter_max_length,
                config.filter_max_steps,
            )),
            config.filter_timeout(),
        )
    }

    pub fn check(&self, expression: &str) -> Result<(), FilterError> {
        self.evaluator.check(expression)
    }

    /// Blank expressions pass unconditionally.
    pub async fn try_evaluate(
        &self,
        expression: &str,
        message: Arc<Value>,
    ) -> Result<bool, FilterError> {
        if expression.trim().is_empty() {
            return Ok(true);
        }
        let evaluator = self.evaluator.clone();
        let expression = expression.to_string();
        let task = tokio::task::spawn_blocking(move || evaluator.run(&expression, &message));

        // A timed-out evaluation is abandoned, not killed; the step budget ends it.
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(FilterError::Timeout(self.timeout)),
            Ok(Err(_)) => Err(FilterError::Panicked),
            Ok(Ok(result)) => result,
        }
    }

    /// Whether `hook` wants `message`. Evaluation failures skip the hook.
    pub async fn evaluate(&self, hook: &Hook, message: &Arc<Value>) -> bool {
        let Some(filter) = hook.filter.as_deref() else {
            return true;
        };
        match self.try_evaluate(filter, message.clone()).await {
            Ok(true) => true,
            Ok(false) => {
                metric_inc(FILTER_REJECTED);
                tracing::debug!(hook_id = %hook.id, filter, "event rejected by filter");
                false
            }
            Err(err) => {
                metric_inc(FILTER_ERROR);
                tracing::warn!(hook_id = %hook.id, filter, error = %err, "filter evaluation failed, skipping hook");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<char> = input.chars().collect();
    let peek = |j: usize| chars.get(j).copied();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let (token, width) = match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '.' => (Token::Dot, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            '!' => match (peek(i + 1), peek(i + 2)) {
                (Some('='), Some('=')) => (Token::NotEq, 3),
                (Some('='), _) => (Token::NotEq, 2),
                _ => (Token::Not, 1),
            },
            '=' => match (peek(i + 1), peek(i + 2)) {
                (Some('='), Some('=')) => (Token::Eq, 3),
                (Some('='), _) => (Token::Eq, 2),
                _ => return Err(FilterError::Syntax("assignment is not allowed".to_string())),
            },
            '<' if peek(i + 1) == Some('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if peek(i + 1) == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '&' if peek(i + 1) == Some('&') => (Token::And, 2),
            '|' if peek(i + 1) == Some('|') => (Token::Or, 2),
            '&' | '|' => {
                return Err(FilterError::Syntax("bitwise operators are not supported".to_string()))
            }
            '\'' | '"' => {
                let (text, end) = read_string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = end;
                continue;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while peek(i).map_or(false, |d| d.is_ascii_digit()) {
                    i += 1;
                }
                if peek(i) == Some('.') && peek(i + 1).map_or(false, |d| d.is_ascii_digit()) {
                    i += 1;
                    while peek(i).map_or(false, |d| d.is_ascii_digit()) {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse()
                    .map_err(|_| FilterError::Syntax(format!("invalid number: {text}")))?;
                tokens.push(Token::Number(number));
                continue;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while peek(i).map_or(false, |d| d.is_alphanumeric() || d == '_' || d == '$') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            c => return Err(FilterError::Syntax(format!("unexpected character '{c}'"))),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

/// Read a quoted string starting at `start`; returns the text and the index after it.
fn read_string(chars: &[char], start: usize) -> Result<(String, usize), FilterError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    loop {
        let Some(&c) = chars.get(i) else {
            return Err(FilterError::Syntax("unterminated string".to_string()));
        };
        i += 1;
        if c == quote {
            return Ok((text, i));
        }
        if c != '\\' {
            text.push(c);
            continue;
        }
        let Some(&escaped) = chars.get(i) else {
            return Err(FilterError::Syntax("unterminated string".to_string()));
        };
        i += 1;
        text.push(match escaped {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            other => other,
        });
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Includes,
    StartsWith,
    EndsWith,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "includes" => Some(Method::Includes),
            "startsWith" => Some(Method::StartsWith),
            "endsWith" => Some(Method::EndsWith),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Method::Includes => "includes",
            Method::StartsWith => "startsWith",
            Method::EndsWith => "endsWith",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Message,
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Box<Expr>,
        method: Method,
        arg: Box<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    /// `first (op operand)*` at one precedence level, evaluated left to right.
    Chain(Box<Expr>, Vec<(BinaryOp, Expr)>),
}

const OR_OPS: [(Token, BinaryOp); 1] = [(Token::Or, BinaryOp::Or)];
const AND_OPS: [(Token, BinaryOp); 1] = [(Token::And, BinaryOp::And)];
const EQUALITY_OPS: [(Token, BinaryOp); 2] =
    [(Token::Eq, BinaryOp::Eq), (Token::NotEq, BinaryOp::NotEq)];
const COMPARISON_OPS: [(Token, BinaryOp); 4] = [
    (Token::Lt, BinaryOp::Lt),
    (Token::Le, BinaryOp::Le),
    (Token::Gt, BinaryOp::Gt),
    (Token::Ge, BinaryOp::Ge),
];
const ADDITIVE_OPS: [(Token, BinaryOp); 2] =
    [(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)];
const MULTIPLICATIVE_OPS: [(Token, BinaryOp); 3] = [
    (Token::Star, BinaryOp::Mul),
    (Token::Slash, BinaryOp::Div),
    (Token::Percent, BinaryOp::Rem),
];

type ParseFn = fn(&mut Parser) -> Result<Expr, FilterError>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn parse(tokens: Vec<Token>) -> Result<Expr, FilterError> {
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expression()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(FilterError::Syntax(format!("unexpected token {token:?}"))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), FilterError> {
        match self.next_token() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(FilterError::Syntax(format!(
                "expected {expected:?}, found {token:?}"
            ))),
            None => Err(FilterError::Syntax(format!(
                "expected {expected:?}, found end of expression"
            ))),
        }
    }

    fn descend(&mut self) -> Result<(), FilterError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FilterError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    /// Run `f` one level deeper, restoring the depth afterwards.
    fn nested(&mut self, f: ParseFn) -> Result<Expr, FilterError> {
        let depth = self.depth;
        let result = self.descend().and_then(|_| f(self));
        self.depth = depth;
        result
    }

    fn expression(&mut self) -> Result<Expr, FilterError> {
        self.nested(Self::or)
    }

    fn or(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::and, &OR_OPS)
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::equality, &AND_OPS)
    }

    fn equality(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::comparison, &EQUALITY_OPS)
    }

    fn comparison(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::additive, &COMPARISON_OPS)
    }

    fn additive(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::multiplicative, &ADDITIVE_OPS)
    }

    fn multiplicative(&mut self) -> Result<Expr, FilterError> {
        self.binary(Self::unary, &MULTIPLICATIVE_OPS)
    }

    /// Left-associative chain of `operand (op operand)*`.
    ///
    /// The links stay flat in one node, so a long `||` list does not count
    /// against the depth limit; only the expression length bounds it.
    fn binary(&mut self, operand: ParseFn, ops: &[(Token, BinaryOp)]) -> Result<Expr, FilterError> {
        let first = operand(self)?;
        let mut rest = Vec::new();
        'chain: loop {
            for (token, op) in ops {
                if self.peek() == Some(token) {
                    self.pos += 1;
                    rest.push((*op, operand(self)?));
                    continue 'chain;
                }
            }
            break;
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Chain(Box::new(first), rest))
        }
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        let op = match self.peek() {
            Some(Token::Not) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.pos += 1;
        let operand = self.nested(Self::unary)?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr, FilterError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = match self.next_token() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(FilterError::Syntax(format!(
                                "expected property name, found {other:?}"
                            )))
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        expr = self.call(expr, &name)?;
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    return Err(FilterError::Syntax(
                        "only includes, startsWith and endsWith may be called".to_string(),
                    ))
                }
                _ => return Ok(expr),
            }
            self.descend()?;
        }
    }

    fn call(&mut self, target: Expr, name: &str) -> Result<Expr, FilterError> {
        let method = Method::from_name(name).ok_or_else(|| {
            FilterError::Syntax(format!("method {name} is not available"))
        })?;
        self.expect(Token::LParen)?;
        let arg = self.expression()?;
        if self.peek() == Some(&Token::Comma) {
            return Err(FilterError::Syntax(format!("{name} takes exactly one argument")));
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Call {
            target: Box::new(target),
            method,
            arg: Box::new(arg),
        })
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        match self.next_token() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "message" => Ok(Expr::Message),
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" | "undefined" => Ok(Expr::Null),
                _ => Err(FilterError::Syntax(format!("unknown identifier {name}"))),
            },
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(FilterError::Syntax(format!("unexpected token {token:?}"))),
            None => Err(FilterError::Syntax("unexpected end of expression".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Val<'m> {
    Null,
    Bool(bool),
    Num(f64),
    Str(Cow<'m, str>),
    Array(&'m [Value]),
    Object(&'m Map<String, Value>),
}

impl<'m> Val<'m> {
    fn from_json(value: &'m Value) -> Self {
        match value {
            Value::Null => Val::Null,
            Value::Bool(b) => Val::Bool(*b),
            Value::Number(n) => Val::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Val::Str(Cow::Borrowed(s.as_str())),
            Value::Array(items) => Val::Array(items.as_slice()),
            Value::Object(map) => Val::Object(map),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0 && !n.is_nan(),
            Val::Str(s) => !s.is_empty(),
            Val::Array(_) | Val::Object(_) => true,
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Val::Null => 0.0,
            Val::Bool(b) => f64::from(u8::from(*b)),
            Val::Num(n) => *n,
            Val::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Val::Array(_) | Val::Object(_) => f64::NAN,
        }
    }

    fn to_text(&self) -> String {
        match self {
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Num(n) => format_number(*n),
            Val::Str(s) => s.to_string(),
            Val::Array(items) => serde_json::to_string(items).unwrap_or_default(),
            Val::Object(map) => serde_json::to_string(map).unwrap_or_default(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn strict_equals(a: &Val<'_>, b: &Val<'_>) -> bool {
    match (a, b) {
        (Val::Null, Val::Null) => true,
        (Val::Bool(x), Val::Bool(y)) => x == y,
        (Val::Num(x), Val::Num(y)) => x == y,
        (Val::Str(x), Val::Str(y)) => x == y,
        (Val::Array(x), Val::Array(y)) => x == y,
        (Val::Object(x), Val::Object(y)) => x == y,
        _ => false,
    }
}

fn array_index(n: f64) -> Option<usize> {
    (n >= 0.0 && n.fract() == 0.0 && n < usize::MAX as f64).then_some(n as usize)
}

struct Interpreter<'m> {
    message: &'m Value,
    steps: usize,
    max_steps: usize,
}

impl<'m> Interpreter<'m> {
    fn charge(&mut self, cost: usize) -> Result<(), FilterError> {
        self.steps = self.steps.saturating_add(cost);
        if self.steps > self.max_steps {
            return Err(FilterError::BudgetExceeded(self.max_steps));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Val<'m>, FilterError> {
        self.charge(1)?;
        match expr {
            Expr::Null => Ok(Val::Null),
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Number(n) => Ok(Val::Num(*n)),
            Expr::Str(s) => Ok(Val::Str(Cow::Owned(s.clone()))),
            Expr::Message => Ok(Val::from_json(self.message)),
            Expr::Member(target, name) => {
                let target = self.eval(target)?;
                member(target, name)
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_into(target, index)
            }
            Expr::Call { target, method, arg } => {
                let target = self.eval(target)?;
                let arg = self.eval(arg)?;
                self.call(*method, target, arg)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Val::Bool(!value.truthy()),
                    UnaryOp::Neg => Val::Num(-value.to_number()),
                    UnaryOp::Plus => Val::Num(value.to_number()),
                })
            }
            Expr::Chain(first, rest) => {
                let mut acc = self.eval(first)?;
                for (op, operand) in rest {
                    self.charge(1)?;
                    acc = match op {
                        BinaryOp::And if !acc.truthy() => acc,
                        BinaryOp::Or if acc.truthy() => acc,
                        BinaryOp::And | BinaryOp::Or => self.eval(operand)?,
                        _ => {
                            let right = self.eval(operand)?;
                            apply_binary(*op, acc, right)
                        }
                    };
                }
                Ok(acc)
            }
        }
    }

    fn call(&mut self, method: Method, target: Val<'m>, arg: Val<'m>) -> Result<Val<'m>, FilterError> {
        match (method, &target, &arg) {
            (Method::Includes, Val::Str(s), Val::Str(needle)) => {
                self.charge(s.len())?;
                Ok(Val::Bool(s.contains(&**needle)))
            }
            (Method::Includes, Val::Array(items), needle) => {
                self.charge(items.len())?;
                Ok(Val::Bool(
                    items.iter().any(|item| strict_equals(&Val::from_json(item), needle)),
                ))
            }
            (Method::StartsWith, Val::Str(s), Val::Str(prefix)) => {
                Ok(Val::Bool(s.starts_with(&**prefix)))
            }
            (Method::EndsWith, Val::Str(s), Val::Str(suffix)) => {
                Ok(Val::Bool(s.ends_with(&**suffix)))
            }
            (_, Val::Null, _) => Err(FilterError::Type(format!(
                "cannot call {} on null",
                method.name()
            ))),
            _ => Err(FilterError::Type(format!(
                "{} is not supported for these operands",
                method.name()
            ))),
        }
    }
}

fn member<'m>(target: Val<'m>, name: &str) -> Result<Val<'m>, FilterError> {
    match target {
        Val::Object(map) => Ok(map.get(name).map(Val::from_json).unwrap_or(Val::Null)),
        Val::Array(items) if name == "length" => Ok(Val::Num(items.len() as f64)),
        Val::Str(s) if name == "length" => Ok(Val::Num(s.chars().count() as f64)),
        Val::Null => Err(FilterError::Type(format!(
            "cannot read property {name} of null"
        ))),
        _ => Ok(Val::Null),
    }
}

fn index_into<'m>(target: Val<'m>, index: Val<'m>) -> Result<Val<'m>, FilterError> {
    match (target, index) {
        (Val::Null, index) => Err(FilterError::Type(format!(
            "cannot read property {} of null",
            index.to_text()
        ))),
        (Val::Object(map), key) => Ok(map
            .get(key.to_text().as_str())
            .map(Val::from_json)
            .unwrap_or(Val::Null)),
        (Val::Array(items), Val::Num(n)) => Ok(array_index(n)
            .and_then(|i| items.get(i))
            .map(Val::from_json)
            .unwrap_or(Val::Null)),
        (Val::Str(s), Val::Num(n)) => Ok(array_index(n)
            .and_then(|i| s.chars().nth(i))
            .map(|c| Val::Str(Cow::Owned(c.to_string())))
            .unwrap_or(Val::Null)),
        (target, Val::Str(name)) => member(target, &name),
        _ => Ok(Val::Null),
    }
}

fn apply_binary<'m>(op: BinaryOp, left: Val<'m>, right: Val<'m>) -> Val<'m> {
    match op {
        BinaryOp::Add => {
            if matches!(left, Val::Str(_)) || matches!(right, Val::Str(_)) {
                Val::Str(Cow::Owned(format!("{}{}", left.to_text(), right.to_text())))
            } else {
                Val::Num(left.to_number() + right.to_number())
            }
        }
        BinaryOp::Sub => Val::Num(left.to_number() - right.to_number()),
        BinaryOp::Mul => Val::Num(left.to_number() * right.to_number()),
        BinaryOp::Div => Val::Num(left.to_number() / right.to_number()),
        BinaryOp::Rem => Val::Num(left.to_number() % right.to_number()),
        BinaryOp::Eq => Val::Bool(strict_equals(&left, &right)),
        BinaryOp::NotEq => Val::Bool(!strict_equals(&left, &right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            Val::Bool(ordering.map_or(false, |o| match op {
                BinaryOp::Lt => o == Ordering::Less,
                BinaryOp::Le => o != Ordering::Greater,
                BinaryOp::Gt => o == Ordering::Greater,
                _ => o != Ordering::Less,
            }))
        }
        BinaryOp::And => Val::Bool(left.truthy() && right.truthy()),
        BinaryOp::Or => Val::Bool(left.truthy() || right.truthy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> Value {
        json!({
            "topic": "orders",
            "originator": "billing-service",
            "timestamp": "2024-01-01T00:00:00.000Z",
            "mime-type": "application/json",
            "payload": {
                "id": 1,
                "amount": 250.5,
                "tags": ["priority", "eu"],
                "customer": { "name": "Ada", "tier": null }
            }
        })
    }

    fn run(expression: &str) -> Result<bool, FilterError> {
        ExpressionEvaluator::default().run(expression, &message())
    }

    #[test]
    fn arithmetic_comparison() {
        assert_eq!(run("1 + 4 > 3"), Ok(true));
        assert_eq!(run("1+4 > 3"), Ok(true));
        assert_eq!(run("2 * (3 - 1) === 4"), Ok(true));
        assert_eq!(run("10 % 4 == 3"), Ok(false));
    }

    #[test]
    fn literals_coerce_with_truthiness() {
        assert_eq!(run("false"), Ok(false));
        assert_eq!(run("true"), Ok(true));
        assert_eq!(run("0"), Ok(false));
        assert_eq!(run("'x'"), Ok(true));
        assert_eq!(run("''"), Ok(false));
        assert_eq!(run("null"), Ok(false));
    }

    #[test]
    fn reads_message_fields() {
        assert_eq!(run("message.topic == 'orders'"), Ok(true));
        assert_eq!(run("message['mime-type'] === \"application/json\""), Ok(true));
        assert_eq!(run("message.payload.amount >= 250 && message.payload.id === 1"), Ok(true));
        assert_eq!(run("message.payload.tags[0] == 'priority'"), Ok(true));
        assert_eq!(run("message.payload.tags.length == 2"), Ok(true));
        assert_eq!(run("message.payload.customer.name.startsWith('A')"), Ok(true));
        assert_eq!(run("message.originator.endsWith('-service')"), Ok(true));
        assert_eq!(run("message.payload.tags.includes('eu')"), Ok(true));
        assert_eq!(run("message.payload.missing == null"), Ok(true));
        assert_eq!(run("!message.payload.customer.tier"), Ok(true));
        assert_eq!(run("message.payload.id != 1 || message.topic + '!' == 'orders!'"), Ok(true));
    }

    #[test]
    fn logical_operators_short_circuit() {
        // The right-hand side would fail if it were evaluated.
        assert_eq!(run("false && message.nothing.deeper"), Ok(false));
        assert_eq!(run("true || message.nothing.deeper"), Ok(true));
    }

    #[test]
    fn reading_through_null_is_an_error() {
        assert!(matches!(run("message.nothing.deeper == 1"), Err(FilterError::Type(_))));
        assert!(matches!(run("message.payload.customer.tier.includes('x')"), Err(FilterError::Type(_))));
    }

    #[test]
    fn ambient_names_are_unknown() {
        for expression in [
            "process.exit(1)",
            "require('fs')",
            "this.constructor",
            "globalThis",
            "message.constructor('return 1')()",
        ] {
            assert!(
                matches!(run(expression), Err(FilterError::Syntax(_))),
                "{expression} should not parse"
            );
        }
    }

    #[test]
    fn assignment_is_rejected() {
        assert!(matches!(run("message.topic = 'x'"), Err(FilterError::Syntax(_))));
    }

    #[test]
    fn malformed_expressions_are_syntax_errors() {
        for expression in ["1 +", "(1", "'open", "message.", "1 2", "a & b"] {
            assert!(
                matches!(run(expression), Err(FilterError::Syntax(_))),
                "{expression} should be rejected"
            );
        }
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        let evaluator = ExpressionEvaluator::new(10_000, 10_000);
        assert_eq!(evaluator.check(&deep), Err(FilterError::TooDeep(MAX_DEPTH)));
        let negations = format!("{}true", "!".repeat(300));
        assert_eq!(evaluator.check(&negations), Err(FilterError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn long_alternative_lists_are_not_nesting() {
        let alternatives = (1..=100)
            .map(|n| format!("message.a=={n}"))
            .collect::<Vec<_>>()
            .join("||");
        let evaluator = ExpressionEvaluator::new(10_000, 10_000);
        assert_eq!(evaluator.check(&alternatives), Ok(()));
        assert!(evaluator.run(&alternatives, &json!({ "a": 100 })).unwrap());
        assert!(!evaluator.run(&alternatives, &json!({ "a": 101 })).unwrap());
    }

    #[test]
    fn chains_short_circuit_left_to_right() {
        let evaluator = ExpressionEvaluator::new(1_000, 1_000);
        let msg = json!({ "n": 1 });
        assert!(evaluator.run("false && message.missing.x || message.n == 1", &msg).unwrap());
        assert!(evaluator.run("10 - 4 - 3 == 3", &msg).unwrap());
        assert!(evaluator.run("message.n != 2 == true", &msg).unwrap());
    }

    #[test]
    fn step_budget_is_enforced() {
        let evaluator = ExpressionEvaluator::new(1_000, 5);
        let err = evaluator.run("1 + 1 + 1 + 1 + 1", &message()).unwrap_err();
        assert_eq!(err, FilterError::BudgetExceeded(5));
    }

    #[test]
    fn length_is_bounded() {
        let evaluator = ExpressionEvaluator::new(8, 100);
        assert_eq!(evaluator.check("1 + 1 > 1000"), Err(FilterError::TooLong { max: 8 }));
    }

    #[tokio::test]
    async fn sandbox_fails_closed() {
        let sandbox = FilterSandbox::from_config(&EngineConfig::default());
        let message = Arc::new(message());
        let hook = |filter: Option<&str>| Hook {
            id: "h".into(),
            name: "h".to_string(),
            description: None,
            topic: "orders".to_string(),
            endpoint: "http://localhost/".to_string(),
            owner: "alice".to_string(),
            filter: filter.map(str::to_string),
            headers: None,
            confirmed: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        assert!(sandbox.evaluate(&hook(None), &message).await);
        assert!(sandbox.evaluate(&hook(Some("1 + 4 > 3")), &message).await);
        assert!(!sandbox.evaluate(&hook(Some("false")), &message).await);
        assert!(!sandbox.evaluate(&hook(Some("message.nope.nope")), &message).await);
        assert!(!sandbox.evaluate(&hook(Some("(((")), &message).await);
        assert_eq!(sandbox.try_evaluate("   ", message.clone()).await, Ok(true));
    }

    struct Stuck;

    impl Evaluator for Stuck {
        fn run(&self, _expression: &str, _message: &Value) -> Result<bool, FilterError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(true)
        }
    }

    struct Exploding;

    impl Evaluator for Exploding {
        fn run(&self, _expression: &str, _message: &Value) -> Result<bool, FilterError> {
            panic!("evaluator bug")
        }
    }

    #[tokio::test]
    async fn hung_or_panicking_evaluators_are_contained() {
        let message = Arc::new(message());

        let stuck = FilterSandbox::new(Arc::new(Stuck), Duration::from_millis(20));
        assert_eq!(
            stuck.try_evaluate("true", message.clone()).await,
            Err(FilterError::Timeout(Duration::from_millis(20)))
        );

        let exploding = FilterSandbox::new(Arc::new(Exploding), Duration::from_secs(1));
        assert_eq!(exploding.try_evaluate("true", message).await, Err(FilterError::Panicked));
    }
}
