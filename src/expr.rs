//! Predicate expression trees.
//!
//! An [`Expr`] is the sum-type counterpart of a typed lambda body such as
//! `x => x.Age > 18 && x.Name.StartsWith("A")`. Trees are produced either
//! programmatically through the builder methods or by parsing lambda text
//! (see [`Lambda::parse`]), and consumed by the translator and by the
//! evaluator below.

use std::collections::HashMap;
use std::fmt;

use crate::entity::Record;
use crate::error::QueryError;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::value::Value;

/// Captured variables available to lambda text, by identifier.
pub type Bindings = HashMap<String, Value>;

/// Node kinds with stable ordinals.
///
/// The ordinals matter: when both operands of a comparison look like member
/// accesses, the translator picks the side whose innermost node has the
/// higher ordinal as the field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NodeType {
    Add = 0,
    AndAlso = 3,
    Call = 6,
    Constant = 9,
    Convert = 10,
    Divide = 12,
    Equal = 13,
    GreaterThan = 15,
    GreaterThanOrEqual = 16,
    LessThan = 20,
    LessThanOrEqual = 21,
    MemberAccess = 23,
    Multiply = 26,
    Negate = 28,
    NewArrayInit = 32,
    Not = 34,
    NotEqual = 35,
    OrElse = 37,
    Parameter = 38,
    Subtract = 42,
}

impl NodeType {
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn node_type(self) -> NodeType {
        match self {
            BinaryOp::Equal => NodeType::Equal,
            BinaryOp::NotEqual => NodeType::NotEqual,
            BinaryOp::LessThan => NodeType::LessThan,
            BinaryOp::LessThanOrEqual => NodeType::LessThanOrEqual,
            BinaryOp::GreaterThan => NodeType::GreaterThan,
            BinaryOp::GreaterThanOrEqual => NodeType::GreaterThanOrEqual,
            BinaryOp::AndAlso => NodeType::AndAlso,
            BinaryOp::OrElse => NodeType::OrElse,
            BinaryOp::Add => NodeType::Add,
            BinaryOp::Subtract => NodeType::Subtract,
            BinaryOp::Multiply => NodeType::Multiply,
            BinaryOp::Divide => NodeType::Divide,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The lambda parameter, e.g. `x`.
    Parameter(String),
    Constant(Value),
    /// `target.name`
    Member { target: Box<Expr>, name: String },
    /// Type conversion wrapper; evaluation is the identity.
    Convert(Box<Expr>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Instance call when `target` is set, static call otherwise.
    Call {
        target: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
    },
    /// Array literal.
    List(Vec<Expr>),
}

impl Expr {
    pub fn param(name: impl Into<String>) -> Self {
        Expr::Parameter(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn list(items: Vec<Expr>) -> Self {
        Expr::List(items)
    }

    pub fn member(self, name: impl Into<String>) -> Self {
        Expr::Member {
            target: Box::new(self),
            name: name.into(),
        }
    }

    pub fn convert(self) -> Self {
        Expr::Convert(Box::new(self))
    }

    pub fn call(self, method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: Some(Box::new(self)),
            method: method.into(),
            args,
        }
    }

    pub fn static_call(method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: None,
            method: method.into(),
            args,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equal(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Equal, self, other)
    }

    pub fn not_equal(self, other: Expr) -> Self {
        Self::binary(BinaryOp::NotEqual, self, other)
    }

    pub fn less_than(self, other: Expr) -> Self {
        Self::binary(BinaryOp::LessThan, self, other)
    }

    pub fn less_or_equal(self, other: Expr) -> Self {
        Self::binary(BinaryOp::LessThanOrEqual, self, other)
    }

    pub fn greater_than(self, other: Expr) -> Self {
        Self::binary(BinaryOp::GreaterThan, self, other)
    }

    pub fn greater_or_equal(self, other: Expr) -> Self {
        Self::binary(BinaryOp::GreaterThanOrEqual, self, other)
    }

    pub fn and_also(self, other: Expr) -> Self {
        Self::binary(BinaryOp::AndAlso, self, other)
    }

    pub fn or_else(self, other: Expr) -> Self {
        Self::binary(BinaryOp::OrElse, self, other)
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            Expr::Parameter(_) => NodeType::Parameter,
            Expr::Constant(_) => NodeType::Constant,
            Expr::Member { .. } => NodeType::MemberAccess,
            Expr::Convert(_) => NodeType::Convert,
            Expr::Not(_) => NodeType::Not,
            Expr::Negate(_) => NodeType::Negate,
            Expr::Binary { op, .. } => op.node_type(),
            Expr::Call { .. } => NodeType::Call,
            Expr::List(_) => NodeType::NewArrayInit,
        }
    }

    /// The node at the bottom of a member / conversion chain:
    /// `x.Profile.Age` yields the parameter `x`, a captured `limit.Age`
    /// yields the constant holding `limit`.
    pub fn innermost(&self) -> &Expr {
        match self {
            Expr::Member { target, .. } | Expr::Convert(target) => target.innermost(),
            other => other,
        }
    }

    /// The member access behind an optional conversion wrapper.
    pub fn as_member(&self) -> Option<(&Expr, &str)> {
        match self {
            Expr::Member { target, name } => Some((target, name)),
            Expr::Convert(inner) => inner.as_member(),
            _ => None,
        }
    }

    /// Whether the lambda parameter appears anywhere below this node.
    pub fn references_parameter(&self) -> bool {
        match self {
            Expr::Parameter(_) => true,
            Expr::Constant(_) => false,
            Expr::Member { target, .. } => target.references_parameter(),
            Expr::Convert(inner) | Expr::Not(inner) | Expr::Negate(inner) => {
                inner.references_parameter()
            }
            Expr::Binary { left, right, .. } => {
                left.references_parameter() || right.references_parameter()
            }
            Expr::Call { target, args, .. } => {
                target.as_deref().is_some_and(Expr::references_parameter)
                    || args.iter().any(Expr::references_parameter)
            }
            Expr::List(items) => items.iter().any(Expr::references_parameter),
        }
    }

    /// Evaluates a parameter-free expression.
    ///
    /// Returns `None` for node kinds that cannot be evaluated without a
    /// record (the parameter) or that are not supported.
    pub fn evaluate(&self) -> Option<Value> {
        self.eval(None)
    }

    /// Evaluates the expression with the lambda parameter bound to `record`.
    pub fn evaluate_on(&self, record: &dyn Record) -> Option<Value> {
        self.eval(Some(record))
    }

    fn eval(&self, record: Option<&dyn Record>) -> Option<Value> {
        match self {
            Expr::Parameter(_) => None,
            Expr::Constant(value) => Some(value.clone()),
            Expr::Member { target, name } => {
                if let (Expr::Parameter(_), Some(record)) = (target.as_ref(), record) {
                    return Some(record.field(name).unwrap_or_default());
                }
                eval_member(target.eval(record)?, name)
            }
            Expr::Convert(inner) => inner.eval(record),
            Expr::Not(inner) => Some(Value::Bool(!inner.eval(record)?.is_true())),
            Expr::Negate(inner) => match inner.eval(record)? {
                Value::Int(i) => i.checked_neg().map(Value::Int),
                Value::Float(f) => Some(Value::Float(-f)),
                Value::Null => Some(Value::Null),
                _ => None,
            },
            Expr::Binary { op, left, right } => match op {
                BinaryOp::AndAlso => {
                    if !left.eval(record)?.is_true() {
                        return Some(Value::Bool(false));
                    }
                    Some(Value::Bool(right.eval(record)?.is_true()))
                }
                BinaryOp::OrElse => {
                    if left.eval(record)?.is_true() {
                        return Some(Value::Bool(true));
                    }
                    Some(Value::Bool(right.eval(record)?.is_true()))
                }
                _ => eval_binary(*op, left.eval(record)?, right.eval(record)?),
            },
            Expr::Call {
                target,
                method,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|arg| arg.eval(record))
                    .collect::<Option<Vec<_>>>()?;
                match target {
                    Some(target) => eval_call(target.eval(record)?, method, &args),
                    None => eval_static_call(method, &args),
                }
            }
            Expr::List(items) => items
                .iter()
                .map(|item| item.eval(record))
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
        }
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

fn eval_member(target: Value, name: &str) -> Option<Value> {
    match (target, name) {
        (Value::Null, _) => Some(Value::Null),
        (Value::Map(mut entries), _) => Some(entries.remove(name).unwrap_or_default()),
        (Value::String(s), "Length") => i64::try_from(s.chars().count()).ok().map(Value::Int),
        (Value::List(items), "Length" | "Count") => i64::try_from(items.len()).ok().map(Value::Int),
        _ => None,
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Option<Value> {
    use std::cmp::Ordering;

    if matches!(
        op,
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide
    ) {
        return eval_arithmetic(op, left, right);
    }

    let ordering = left.compare(&right);
    let result = match op {
        BinaryOp::Equal => left == right,
        BinaryOp::NotEqual => left != right,
        BinaryOp::LessThan => ordering == Some(Ordering::Less),
        BinaryOp::LessThanOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::GreaterThan => ordering == Some(Ordering::Greater),
        BinaryOp::GreaterThanOrEqual => {
            matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
        }
        BinaryOp::AndAlso => left.is_true() && right.is_true(),
        BinaryOp::OrElse => left.is_true() || right.is_true(),
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            return None;
        }
    };
    Some(Value::Bool(result))
}

fn eval_arithmetic(op: BinaryOp, left: Value, right: Value) -> Option<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Some(Value::Null),
        (Value::Int(a), Value::Int(b)) => match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Subtract => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Divide => a.checked_div(b),
            _ => None,
        }
        .map(Value::Int),
        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            Some(Value::String(a + &b))
        }
        (left, right) => {
            let (a, b) = (left.as_f64()?, right.as_f64()?);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                _ => return None,
            };
            Some(Value::Float(result))
        }
    }
}

fn eval_call(target: Value, method: &str, args: &[Value]) -> Option<Value> {
    match (&target, method, args) {
        (Value::Null, "Equals", [arg]) => Some(Value::Bool(arg.is_null())),
        (Value::Null, "StartsWith" | "EndsWith" | "Contains", [_]) => Some(Value::Bool(false)),
        (Value::Null, _, _) => Some(Value::Null),
        (Value::String(s), "StartsWith", [Value::String(arg)]) => {
            Some(Value::Bool(s.starts_with(arg.as_str())))
        }
        (Value::String(s), "EndsWith", [Value::String(arg)]) => {
            Some(Value::Bool(s.ends_with(arg.as_str())))
        }
        (Value::String(s), "Contains", [Value::String(arg)]) => {
            Some(Value::Bool(s.contains(arg.as_str())))
        }
        (Value::String(s), "ToUpper", []) => Some(Value::String(s.to_uppercase())),
        (Value::String(s), "ToLower", []) => Some(Value::String(s.to_lowercase())),
        (Value::String(s), "Trim", []) => Some(Value::String(s.trim().to_string())),
        (Value::List(_), "Contains", [item]) => Some(Value::Bool(item.is_in(&target))),
        (Value::List(items), "Count", []) => i64::try_from(items.len()).ok().map(Value::Int),
        // text tests on anything but two strings never match
        (_, "StartsWith" | "EndsWith" | "Contains", [_]) => Some(Value::Bool(false)),
        (_, "Equals", [arg]) => Some(Value::Bool(target == *arg)),
        _ => None,
    }
}

fn eval_static_call(method: &str, args: &[Value]) -> Option<Value> {
    match (method, args) {
        ("Contains", [collection @ Value::List(_), item]) => {
            Some(Value::Bool(item.is_in(collection)))
        }
        _ => None,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Parameter(name) => f.write_str(name),
            Expr::Constant(Value::String(s)) => write!(f, "\"{s}\""),
            Expr::Constant(value) => write!(f, "{value}"),
            Expr::Member { target, name } => write!(f, "{target}.{name}"),
            Expr::Convert(inner) => write!(f, "{inner}"),
            Expr::Not(inner) => write!(f, "!{inner}"),
            Expr::Negate(inner) => write!(f, "-{inner}"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call {
                target,
                method,
                args,
            } => {
                if let Some(target) = target {
                    write!(f, "{target}.")?;
                }
                write!(f, "{method}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A one-parameter boolean lambda: `parameter => body`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    parameter: String,
    body: Expr,
}

impl Lambda {
    pub fn new(parameter: impl Into<String>, body: Expr) -> Self {
        Self {
            parameter: parameter.into(),
            body,
        }
    }

    /// Parses lambda text such as `x => x.Age > 18`.
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        Self::parse_with(text, &Bindings::new())
    }

    /// Parses lambda text, resolving free identifiers from `bindings`.
    pub fn parse_with(text: &str, bindings: &Bindings) -> Result<Self, QueryError> {
        let tokens: Vec<_> = Lexer::new(text).collect();
        let lambda = Parser::new(&tokens, bindings).parse_lambda()?;
        Ok(lambda)
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    pub fn body(&self) -> &Expr {
        &self.body
    }

    /// Runs the lambda against a record. Anything but `true` is a miss.
    pub fn invoke(&self, record: &dyn Record) -> bool {
        self.body
            .evaluate_on(record)
            .is_some_and(|value| value.is_true())
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.parameter, self.body)
    }
}
