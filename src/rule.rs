//! Access rules and list filters.
//!
//! Each collection carries one rule per operation. A rule is stored as an
//! optional string: `None` locks the operation to superusers, `""` allows
//! everyone, and anything else is an expression in a small filter language
//! evaluated against the requester and the record:
//!
//! ```text
//! @request.auth.id != ""
//! @request.auth.id = uploader_id
//! category = "Music" && (description ~ "live" || @request.auth.isAdmin = true)
//! ```
//!
//! The same parser handles the optional `filter` of a list request.

use crate::error::{ApiError, ApiResult};
use serde_json::Value;

/// Raw rule as stored in a collection definition
pub type RuleSource = Option<String>;

/// The five operations a collection guards independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::List,
        Operation::View,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::View => "view",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "list" => Some(Self::List),
            "view" => Some(Self::View),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Anything an expression can read named values from
pub trait FieldSource {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl FieldSource for serde_json::Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Values visible to an expression while it is evaluated
pub struct Scope<'a> {
    /// The authenticated requester, if any
    pub auth: Option<&'a dyn FieldSource>,
    /// The record under test
    pub record: &'a dyn FieldSource,
    /// The submitted payload for create/update requests
    pub data: Option<&'a dyn FieldSource>,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "~",
            Self::NotLike => "!~",
        }
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `@request.auth.<field>`
    Auth(String),
    /// `@request.data.<field>`
    Data(String),
    /// A field of the record
    Field(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Auth(name) => write!(f, "@request.auth.{}", name),
            Operand::Data(name) => write!(f, "@request.data.{}", name),
            Operand::Field(name) => write!(f, "{}", name),
            Operand::Str(s) => write!(f, "{:?}", s),
            Operand::Number(n) => write!(f, "{}", n),
            Operand::Bool(b) => write!(f, "{}", b),
            Operand::Null => write!(f, "null"),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Compare { left, op, right } => write!(f, "{} {} {}", left, op.as_str(), right),
            Expr::And(a, b) => write!(f, "({} && {})", a, b),
            Expr::Or(a, b) => write!(f, "({} || {})", a, b),
        }
    }
}

impl Expr {
    /// Parse a filter or rule expression
    pub fn parse(input: &str) -> ApiResult<Expr> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ApiError::InvalidExpression("empty expression".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ApiError::InvalidExpression(format!(
                "unexpected {} in '{}'",
                tok.describe(),
                input
            )));
        }
        Ok(expr)
    }

    /// Record field names this expression reads
    pub fn record_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Field(name) = operand {
                        out.push(name.as_str());
                    }
                }
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
        }
    }

    /// Evaluate against a scope
    pub fn eval(&self, scope: &Scope<'_>) -> bool {
        match self {
            Expr::Compare { left, op, right } => {
                if scope.auth.is_none() && anonymous_identity_vs_value(left, right) {
                    // No identity never equals a stored value, even an empty one
                    return matches!(op, CompareOp::Neq | CompareOp::NotLike);
                }
                let l = resolve(left, scope);
                let r = resolve(right, scope);
                compare(&l, *op, &r)
            }
            Expr::And(a, b) => a.eval(scope) && b.eval(scope),
            Expr::Or(a, b) => a.eval(scope) || b.eval(scope),
        }
    }
}

/// A rule after resolving its stored form
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// `null`: only superusers may act
    Locked,
    /// `""`: anyone may act
    Public,
    Expr(Expr),
}

/// Shape of a rule, for display and reasoning about policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePolicy {
    Locked,
    Unrestricted,
    AuthenticatedOnly,
    FieldEquals {
        auth_field: String,
        record_field: String,
    },
    Custom,
}

impl std::fmt::Display for RulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulePolicy::Locked => write!(f, "Locked (superusers only)"),
            RulePolicy::Unrestricted => write!(f, "Unrestricted"),
            RulePolicy::AuthenticatedOnly => write!(f, "AuthenticatedOnly"),
            RulePolicy::FieldEquals {
                auth_field,
                record_field,
            } => write!(
                f,
                "FieldEquals(@request.auth.{} == record.{})",
                auth_field, record_field
            ),
            RulePolicy::Custom => write!(f, "Custom"),
        }
    }
}

impl Rule {
    pub fn parse(source: Option<&str>) -> ApiResult<Rule> {
        match source {
            None => Ok(Rule::Locked),
            Some(s) if s.trim().is_empty() => Ok(Rule::Public),
            Some(s) => Ok(Rule::Expr(Expr::parse(s)?)),
        }
    }

    /// Classify the rule into one of the common policy shapes
    pub fn policy(&self) -> RulePolicy {
        match self {
            Rule::Locked => RulePolicy::Locked,
            Rule::Public => RulePolicy::Unrestricted,
            Rule::Expr(Expr::Compare { left, op, right }) => classify(left, *op, right),
            Rule::Expr(_) => RulePolicy::Custom,
        }
    }

    /// Evaluate for a non-superuser. `Locked` is always false.
    pub fn allows(&self, scope: &Scope<'_>) -> bool {
        match self {
            Rule::Locked => false,
            Rule::Public => true,
            Rule::Expr(expr) => expr.eval(scope),
        }
    }
}

fn classify(left: &Operand, op: CompareOp, right: &Operand) -> RulePolicy {
    let pair = match (left, right) {
        (Operand::Auth(a), other) | (other, Operand::Auth(a)) => Some((a, other)),
        _ => None,
    };
    let Some((auth_field, other)) = pair else {
        return RulePolicy::Custom;
    };

    match (op, other) {
        (CompareOp::Neq, Operand::Str(s)) if auth_field == "id" && s.is_empty() => {
            RulePolicy::AuthenticatedOnly
        }
        (CompareOp::Eq, Operand::Field(record_field)) => RulePolicy::FieldEquals {
            auth_field: auth_field.clone(),
            record_field: record_field.clone(),
        },
        _ => RulePolicy::Custom,
    }
}

fn anonymous_identity_vs_value(left: &Operand, right: &Operand) -> bool {
    let is_value = |o: &Operand| matches!(o, Operand::Field(_) | Operand::Data(_));
    match (left, right) {
        (Operand::Auth(_), other) | (other, Operand::Auth(_)) => is_value(other),
        _ => false,
    }
}

fn resolve(operand: &Operand, scope: &Scope<'_>) -> Value {
    match operand {
        Operand::Auth(name) => match scope.auth {
            Some(auth) => auth.lookup(name).unwrap_or(Value::Null),
            None => Value::String(String::new()),
        },
        Operand::Data(name) => scope
            .data
            .and_then(|d| d.lookup(name))
            .unwrap_or(Value::Null),
        Operand::Field(name) => scope.record.lookup(name).unwrap_or(Value::Null),
        Operand::Str(s) => Value::String(s.clone()),
        Operand::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Operand::Bool(b) => Value::Bool(*b),
        Operand::Null => Value::Null,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn scalar_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => as_number(l) == as_number(r),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        // An unset bool reads as false
        (Value::Bool(b), Value::Null) | (Value::Null, Value::Bool(b)) => !b,
        _ => as_text(l) == as_text(r),
    }
}

/// Expand arrays into their elements; an empty array reads as `""`
fn elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) if items.is_empty() => vec![Value::String(String::new())],
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn compare(l: &Value, op: CompareOp, r: &Value) -> bool {
    let left = elements(l);
    let right = elements(r);
    match op {
        CompareOp::Neq => !compare(l, CompareOp::Eq, r),
        CompareOp::NotLike => !compare(l, CompareOp::Like, r),
        _ => left
            .iter()
            .any(|a| right.iter().any(|b| compare_scalar(a, op, b))),
    }
}

fn compare_scalar(l: &Value, op: CompareOp, r: &Value) -> bool {
    match op {
        CompareOp::Eq => scalar_equal(l, r),
        CompareOp::Neq => !scalar_equal(l, r),
        CompareOp::Like => as_text(l)
            .to_lowercase()
            .contains(&as_text(r).to_lowercase()),
        CompareOp::NotLike => !as_text(l)
            .to_lowercase()
            .contains(&as_text(r).to_lowercase()),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let ordering = match (as_number(l), as_number(r)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(as_text(l).cmp(&as_text(r))),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Gte => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Op(CompareOp),
    Str(String),
    Number(f64),
    Ident(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Op(op) => format!("'{}'", op.as_str()),
            Token::Str(s) => format!("string {:?}", s),
            Token::Number(n) => format!("number {}", n),
            Token::Ident(name) => format!("'{}'", name),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '@'
}

fn tokenize(input: &str) -> ApiResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Neq));
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push(Token::Op(CompareOp::NotLike));
                i += 2;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Gte));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Lte));
                i += 2;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '>' => {
                tokens.push(Token::Op(CompareOp::Gt));
                i += 1;
            }
            '<' => {
                tokens.push(Token::Op(CompareOp::Lt));
                i += 1;
            }
            '~' => {
                tokens.push(Token::Op(CompareOp::Like));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ApiError::InvalidExpression(format!(
                                "unterminated string in '{}'",
                                input
                            )))
                        }
                        Some('\\') if chars.get(i + 1) == Some(&quote) => {
                            value.push(quote);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ApiError::InvalidExpression(format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(n));
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ApiError::InvalidExpression(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )))
            }
        }
    }

    Ok(tokens)
}

/// Deepest parenthesis nesting an expression may use
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> ApiResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ApiResult<Expr> {
        let mut left = self.parse_term()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> ApiResult<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            if self.depth >= MAX_NESTING {
                return Err(ApiError::InvalidExpression(format!(
                    "parentheses nested deeper than {}",
                    MAX_NESTING
                )));
            }
            self.depth += 1;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(ApiError::InvalidExpression("missing ')'".to_string())),
            };
        }

        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(other) => {
                return Err(ApiError::InvalidExpression(format!(
                    "expected comparison operator, found {}",
                    other.describe()
                )))
            }
            None => {
                return Err(ApiError::InvalidExpression(
                    "expected comparison operator at end of expression".to_string(),
                ))
            }
        };
        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> ApiResult<Operand> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Number(n)) => Ok(Operand::Number(n)),
            Some(Token::Ident(name)) => ident_operand(&name),
            Some(other) => Err(ApiError::InvalidExpression(format!(
                "expected operand, found {}",
                other.describe()
            ))),
            None => Err(ApiError::InvalidExpression(
                "expected operand at end of expression".to_string(),
            )),
        }
    }
}

fn ident_operand(name: &str) -> ApiResult<Operand> {
    match name {
        "true" => return Ok(Operand::Bool(true)),
        "false" => return Ok(Operand::Bool(false)),
        "null" => return Ok(Operand::Null),
        _ => {}
    }

    if let Some(field) = name.strip_prefix("@request.auth.") {
        if !field.is_empty() {
            return Ok(Operand::Auth(field.to_string()));
        }
    }
    if let Some(field) = name.strip_prefix("@request.data.") {
        if !field.is_empty() {
            return Ok(Operand::Data(field.to_string()));
        }
    }
    if name.starts_with('@') || name.contains('.') || name.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(ApiError::InvalidExpression(format!(
            "unsupported identifier '{}'",
            name
        )));
    }

    Ok(Operand::Field(name.to_string()))
}
