//! Atomic `field operator value` conditions.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::expr::Expr;
use crate::operator::CriteriaOperator;
use crate::query::Query;
use crate::value::Value;

/// Deferred value producer.
pub type Thunk = Arc<dyn Fn() -> Value + Send + Sync>;

/// Named conversion applied to a field before comparison or sorting.
///
/// The query layer only carries converters; interpreting them is up to the
/// execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConverter {
    pub name: String,
    pub parameter: Option<Value>,
}

impl FieldConverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter: None,
        }
    }

    pub fn with_parameter(mut self, parameter: impl Into<Value>) -> Self {
        self.parameter = Some(parameter.into());
        self
    }
}

/// Raw value of a criterion, before resolution.
#[derive(Clone)]
pub enum CriterionValue {
    Literal(Value),
    /// Evaluated on first read; node kinds that cannot be evaluated resolve
    /// to null.
    Expression(Expr),
    /// Invoked on first read.
    Lazy(Thunk),
    /// A subquery.
    Query(Arc<Query>),
}

impl CriterionValue {
    pub fn lazy(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        CriterionValue::Lazy(Arc::new(f))
    }

    fn resolve(&self) -> Value {
        match self {
            CriterionValue::Literal(value) => value.clone(),
            CriterionValue::Expression(expr) => expr.evaluate().unwrap_or_default(),
            CriterionValue::Lazy(thunk) => thunk(),
            CriterionValue::Query(_) => Value::Null,
        }
    }
}

impl fmt::Debug for CriterionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriterionValue::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            CriterionValue::Expression(expr) => f.debug_tuple("Expression").field(expr).finish(),
            CriterionValue::Lazy(_) => f.write_str("Lazy(..)"),
            CriterionValue::Query(query) => f.debug_tuple("Query").field(query).finish(),
        }
    }
}

impl From<Value> for CriterionValue {
    fn from(value: Value) -> Self {
        CriterionValue::Literal(value)
    }
}

impl From<Expr> for CriterionValue {
    fn from(expr: Expr) -> Self {
        match expr {
            Expr::Constant(value) => CriterionValue::Literal(value),
            other => CriterionValue::Expression(other),
        }
    }
}

impl From<Query> for CriterionValue {
    fn from(query: Query) -> Self {
        CriterionValue::Query(Arc::new(query))
    }
}

impl From<Arc<Query>> for CriterionValue {
    fn from(query: Arc<Query>) -> Self {
        CriterionValue::Query(query)
    }
}

/// One condition of a criteria tree.
///
/// The field name and operator are fixed at construction (the operator is
/// only rewritten by the owning tree when the criterion is attached). The
/// value is resolved at most once and cached; clones carry the cached value.
#[derive(Debug, Clone)]
pub struct Criterion {
    name: String,
    operator: CriteriaOperator,
    value: CriterionValue,
    resolved: OnceLock<Value>,
    converter: Option<FieldConverter>,
}

impl Criterion {
    pub fn new(
        name: impl Into<String>,
        operator: CriteriaOperator,
        value: impl Into<CriterionValue>,
    ) -> Self {
        Self {
            name: name.into(),
            operator,
            value: value.into(),
            resolved: OnceLock::new(),
            converter: None,
        }
    }

    pub fn with_converter(mut self, converter: Option<FieldConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> CriteriaOperator {
        self.operator
    }

    pub(crate) fn set_operator(&mut self, operator: CriteriaOperator) {
        self.operator = operator;
    }

    pub fn raw_value(&self) -> &CriterionValue {
        &self.value
    }

    /// The resolved value. Subquery criteria resolve to null; use
    /// [`Criterion::subquery`] for them.
    pub fn value(&self) -> &Value {
        self.resolved.get_or_init(|| self.value.resolve())
    }

    pub fn subquery(&self) -> Option<&Query> {
        match &self.value {
            CriterionValue::Query(query) => Some(query),
            _ => None,
        }
    }

    pub(crate) fn subquery_mut(&mut self) -> Option<&mut Arc<Query>> {
        match &mut self.value {
            CriterionValue::Query(query) => Some(query),
            _ => None,
        }
    }

    pub fn converter(&self) -> Option<&FieldConverter> {
        self.converter.as_ref()
    }

    /// Clone that also detaches an embedded subquery.
    pub(crate) fn deep_clone(&self) -> Self {
        let mut copy = self.clone();
        if let Some(query) = copy.subquery_mut() {
            *query = Arc::new(query.deep_clone());
        }
        copy
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            CriteriaOperator::IsNull | CriteriaOperator::NotNull => {
                return write!(f, "{} {}", self.name, self.operator);
            }
            _ => {}
        }
        match self.subquery() {
            Some(query) => {
                let entity = query
                    .entity_type()
                    .map_or_else(|| "?".to_string(), |entity| entity.name().to_string());
                write!(f, "{} {} (SELECT FROM {entity}", self.name, self.operator)?;
                if query.entries().is_empty() {
                    write!(f, ")")
                } else {
                    write!(f, " WHERE {query})")
                }
            }
            None => write!(f, "{} {} {}", self.name, self.operator, self.value()),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum SerializedValue<'a> {
    Query(&'a Query),
    Value(&'a Value),
}

impl Serialize for Criterion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self.subquery() {
            Some(query) => SerializedValue::Query(query),
            None => SerializedValue::Value(self.value()),
        };
        let mut state = serializer.serialize_struct("Criterion", 4)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("operator", &self.operator)?;
        state.serialize_field("value", &value)?;
        state.serialize_field("converter", &self.converter)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_literal_value() {
        let criterion = Criterion::new("Age", CriteriaOperator::GreaterThan, Value::Int(18));
        assert_eq!(criterion.name(), "Age");
        assert_eq!(criterion.value(), &Value::Int(18));
        assert_eq!(criterion.to_string(), "Age > 18");
    }

    #[test]
    fn test_resolution_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let criterion = Criterion::new(
            "Age",
            CriteriaOperator::Equal,
            CriterionValue::lazy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Value::Int(42)
            }),
        );

        let first = criterion.value();
        let second = criterion.value();
        assert!(std::ptr::eq(first, second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_does_not_resolve_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let criterion = Criterion::new(
            "Age",
            CriteriaOperator::Equal,
            CriterionValue::lazy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Value::Int(7)
            }),
        )
        .with_converter(Some(FieldConverter::new("abs")));
        criterion.value();

        let copy = criterion.clone();
        assert_eq!(copy.value(), &Value::Int(7));
        assert_eq!(copy.converter(), Some(&FieldConverter::new("abs")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expression_value_is_evaluated() {
        let expr = Expr::binary(BinaryOp::Add, Expr::constant(10), Expr::constant(8));
        let criterion = Criterion::new("Age", CriteriaOperator::LessThan, expr);
        assert_eq!(criterion.value(), &Value::Int(18));
    }

    #[test]
    fn test_unsupported_expression_resolves_to_null() {
        let expr = Expr::param("x").member("Age");
        let criterion = Criterion::new("Age", CriteriaOperator::Equal, expr);
        assert!(criterion.value().is_null());
    }

    #[test]
    fn test_serialize() {
        let criterion = Criterion::new("Name", CriteriaOperator::BeginLike, Value::from("A"));
        let json = serde_json::to_value(&criterion).unwrap();
        assert_eq!(json["name"], "Name");
        assert_eq!(json["operator"], "BeginLike");
        assert_eq!(json["value"], "A");
    }
}
