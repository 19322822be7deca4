//! Declarative expectation expressions
//!
//! An [`Expression`] describes what a value should look like. Shapes are
//! decided once, when the expression is built (from a `serde_json::Value`, a
//! regex, or a closure), so the matcher never has to sniff types while it
//! recurses.
//!
//! Conversion from JSON follows a few conventions:
//! - the strings `"$exists"`, `"$string"`, `"$date"` and `"$int"` become [`Check`]s
//! - object keys `$not`, `$unordered`, `$contains`, `$length`, `$gt`, `$gte`,
//!   `$lt` and `$lte` become [`Directive`]s; any other key is a field clause
//! - arrays become positional [`Expression::Array`]s

use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::ContextError;
use crate::stash::Stash;

/// Future returned by a predicate
pub type PredicateFuture = BoxFuture<'static, anyhow::Result<bool>>;

/// A user-supplied test over the actual value.
///
/// Returning `Ok(false)`, returning an error, or panicking all count as a
/// predicate failure.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    func: Arc<dyn Fn(Value) -> PredicateFuture + Send + Sync>,
}

impl Predicate {
    /// Wrap an async predicate
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            name: "predicate".to_string(),
            func: Arc::new(move |value| func(value).boxed()),
        }
    }

    /// Wrap a plain synchronous check
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(move |value| {
            let func = func.clone();
            async move { Ok(func(&value)) }
        })
    }

    /// Give the predicate a name for failure messages
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The user closure runs inside the returned future so that a panic in
    /// it can be caught by whoever awaits.
    pub(crate) fn call(&self, value: Value) -> PredicateFuture {
        let func = self.func.clone();
        async move { func(value).await }.boxed()
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.name)
    }
}

/// Type checks written as bare marker strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Exists,
    String,
    Date,
    Int,
}

impl Check {
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "$exists" => Some(Check::Exists),
            "$string" => Some(Check::String),
            "$date" => Some(Check::Date),
            "$int" => Some(Check::Int),
            _ => None,
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            Check::Exists => "$exists",
            Check::String => "$string",
            Check::Date => "$date",
            Check::Int => "$int",
        }
    }
}

/// Operator keys recognised inside an object expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Not,
    Unordered,
    Contains,
    Length,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$not" => Some(Operator::Not),
            "$unordered" => Some(Operator::Unordered),
            "$contains" => Some(Operator::Contains),
            "$length" => Some(Operator::Length),
            "$gt" => Some(Operator::Gt),
            "$gte" => Some(Operator::Gte),
            "$lt" => Some(Operator::Lt),
            "$lte" => Some(Operator::Lte),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Operator::Not => "$not",
            Operator::Unordered => "$unordered",
            Operator::Contains => "$contains",
            Operator::Length => "$length",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
        }
    }
}

/// An operator applied to the actual value in place of field recursion.
///
/// The operand is itself an expression so that stash references inside it
/// (`{"$gt": ":minimum"}`) resolve like any other value.
#[derive(Debug, Clone)]
pub struct Directive {
    pub op: Operator,
    pub operand: Box<Expression>,
}

/// One conjunct of an object expression
#[derive(Debug, Clone)]
pub enum Clause {
    Field(String, Expression),
    Directive(Directive),
}

/// A declarative description of an expected value
#[derive(Debug, Clone)]
pub enum Expression {
    /// Compared by value. Numbers compare numerically.
    Literal(Value),
    /// Matched against the text form of the actual value
    Pattern(Regex),
    Predicate(Predicate),
    Check(Check),
    /// Every clause must hold
    Object(Vec<Clause>),
    /// Only matches an array of the same length, element by element
    Array(Vec<Expression>),
}

impl Expression {
    /// Regular-expression expression
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Expression::Pattern)
    }

    pub fn predicate<F>(func: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Expression::Predicate(Predicate::from_fn(func))
    }

    /// Object expression from `(key, expression)` pairs; directive keys are
    /// recognised the same way as in JSON conversion
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Expression)>,
    {
        Expression::Object(
            entries
                .into_iter()
                .map(|(key, expr)| clause(key.into(), expr))
                .collect(),
        )
    }

    pub fn directive(op: Operator, operand: impl Into<Expression>) -> Self {
        Expression::Object(vec![Clause::Directive(Directive {
            op,
            operand: Box::new(operand.into()),
        })])
    }

    pub fn not(inner: impl Into<Expression>) -> Self {
        Self::directive(Operator::Not, inner)
    }

    pub fn unordered(items: Vec<Expression>) -> Self {
        Self::directive(Operator::Unordered, Expression::Array(items))
    }

    pub fn contains(items: Vec<Expression>) -> Self {
        Self::directive(Operator::Contains, Expression::Array(items))
    }

    pub fn length(n: u64) -> Self {
        Self::directive(Operator::Length, Value::from(n))
    }

    pub fn gt(n: impl Into<Value>) -> Self {
        Self::directive(Operator::Gt, n.into())
    }

    pub fn gte(n: impl Into<Value>) -> Self {
        Self::directive(Operator::Gte, n.into())
    }

    pub fn lt(n: impl Into<Value>) -> Self {
        Self::directive(Operator::Lt, n.into())
    }

    pub fn lte(n: impl Into<Value>) -> Self {
        Self::directive(Operator::Lte, n.into())
    }

    /// A JSON rendering used in failure diffs. Patterns render as `/re/`,
    /// predicates by name.
    pub fn to_display_value(&self) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::Pattern(re) => Value::String(format!("/{}/", re.as_str())),
            Expression::Predicate(p) => Value::String(format!("<{}>", p.name())),
            Expression::Check(c) => Value::String(c.marker().to_string()),
            Expression::Array(items) => {
                Value::Array(items.iter().map(Expression::to_display_value).collect())
            }
            Expression::Object(clauses) => {
                let mut map = serde_json::Map::new();
                for clause in clauses {
                    match clause {
                        Clause::Field(key, expr) => {
                            map.insert(key.clone(), expr.to_display_value());
                        }
                        Clause::Directive(d) => {
                            map.insert(d.op.key().to_string(), d.operand.to_display_value());
                        }
                    }
                }
                Value::Object(map)
            }
        }
    }

    /// Replace stash references (`":key.path"` literals) throughout the
    /// expression. Patterns, predicates and checks pass through untouched;
    /// object keys are never substituted.
    pub fn substitute<'a>(&'a self, stash: &'a Stash) -> BoxFuture<'a, Result<Expression, ContextError>> {
        async move {
            match self {
                Expression::Literal(Value::String(s)) if s.starts_with(':') => {
                    let value = stash.get_keypath(&s[1..]).await?;
                    Ok(Expression::from(value))
                }
                Expression::Literal(_)
                | Expression::Pattern(_)
                | Expression::Predicate(_)
                | Expression::Check(_) => Ok(self.clone()),
                Expression::Array(items) => {
                    let items = futures::future::try_join_all(
                        items.iter().map(|item| item.substitute(stash)),
                    )
                    .await?;
                    Ok(Expression::Array(items))
                }
                Expression::Object(clauses) => {
                    let clauses = futures::future::try_join_all(clauses.iter().map(|c| async move {
                        match c {
                            Clause::Field(key, expr) => Ok::<_, ContextError>(Clause::Field(
                                key.clone(),
                                expr.substitute(stash).await?,
                            )),
                            Clause::Directive(d) => Ok(Clause::Directive(Directive {
                                op: d.op,
                                operand: Box::new(d.operand.substitute(stash).await?),
                            })),
                        }
                    }))
                    .await?;
                    Ok(Expression::Object(clauses))
                }
            }
        }
        .boxed()
    }
}

fn clause(key: String, expr: Expression) -> Clause {
    match Operator::from_key(&key) {
        Some(op) => Clause::Directive(Directive {
            op,
            operand: Box::new(expr),
        }),
        None => Clause::Field(key, expr),
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => match Check::from_marker(&s) {
                Some(check) => Expression::Check(check),
                None => Expression::Literal(Value::String(s)),
            },
            Value::Array(items) => Expression::Array(items.into_iter().map(Expression::from).collect()),
            Value::Object(map) => Expression::Object(
                map.into_iter()
                    .map(|(key, v)| clause(key, Expression::from(v)))
                    .collect(),
            ),
            scalar => Expression::Literal(scalar),
        }
    }
}

impl Expression {
    /// An expectation body. A top-level string is compared verbatim with the
    /// response text, marker strings included; anything else converts as usual.
    pub fn body(value: Value) -> Self {
        match value {
            Value::String(s) => Expression::Literal(Value::String(s)),
            other => Expression::from(other),
        }
    }
}

impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Expression::from(Value::String(s.to_string()))
    }
}

impl From<String> for Expression {
    fn from(s: String) -> Self {
        Expression::from(Value::String(s))
    }
}

impl From<i32> for Expression {
    fn from(n: i32) -> Self {
        Expression::Literal(Value::from(n))
    }
}

impl From<i64> for Expression {
    fn from(n: i64) -> Self {
        Expression::Literal(Value::from(n))
    }
}

impl From<u64> for Expression {
    fn from(n: u64) -> Self {
        Expression::Literal(Value::from(n))
    }
}

impl From<f64> for Expression {
    fn from(n: f64) -> Self {
        Expression::Literal(Value::from(n))
    }
}

impl From<bool> for Expression {
    fn from(b: bool) -> Self {
        Expression::Literal(Value::Bool(b))
    }
}

impl From<Regex> for Expression {
    fn from(re: Regex) -> Self {
        Expression::Pattern(re)
    }
}

impl From<Predicate> for Expression {
    fn from(p: Predicate) -> Self {
        Expression::Predicate(p)
    }
}

impl From<Vec<Expression>> for Expression {
    fn from(items: Vec<Expression>) -> Self {
        Expression::Array(items)
    }
}
