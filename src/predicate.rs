//! In-memory evaluation of criteria trees.
//!
//! [`Query::predicate`] compiles a tree into a closure over a record type.
//! Compiled predicates are cached per record type on the query and dropped
//! whenever the tree changes.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::criterion::Criterion;
use crate::entity::{EntityType, Record};
use crate::operator::{CriteriaOperator, QueryOperator};
use crate::query::{Query, QueryItem};
use crate::value::Value;

/// A compiled filter over records of type `T`.
pub struct Predicate<T: ?Sized>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T: ?Sized> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Predicate(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

impl<T: ?Sized> Predicate<T> {
    pub fn new(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Predicate(Arc::new(f))
    }

    fn constant(result: bool) -> Self {
        Self::new(move |_| result)
    }

    pub fn matches(&self, record: &T) -> bool {
        (self.0)(record)
    }
}

impl<T> Predicate<T> {
    pub fn filter<'a>(&self, records: &'a [T]) -> Vec<&'a T> {
        records.iter().filter(|record| self.matches(record)).collect()
    }
}

/// Compiled predicates keyed by record type. Clones start empty.
#[derive(Default)]
pub(crate) struct PredicateCache(Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>);

impl PredicateCache {
    fn get<T: 'static>(&self) -> Option<Predicate<T>> {
        let cache = self.0.lock().ok()?;
        let predicate = cache
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Predicate<T>>())
            .cloned();
        predicate
    }

    fn insert<T: 'static>(&self, predicate: Predicate<T>) {
        if let Ok(mut cache) = self.0.lock() {
            cache.insert(TypeId::of::<T>(), Arc::new(predicate));
        }
    }

    pub(crate) fn clear(&mut self) {
        if let Ok(cache) = self.0.get_mut() {
            cache.clear();
        }
    }

    fn len(&self) -> usize {
        self.0.lock().map(|cache| cache.len()).unwrap_or_default()
    }
}

impl Clone for PredicateCache {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for PredicateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PredicateCache({} compiled)", self.len())
    }
}

impl Query {
    /// The tree compiled into a filter over `T`.
    ///
    /// Queries with subqueries, joins or recursive criteria cannot be
    /// evaluated in memory and reject every record. An empty tree accepts
    /// every record.
    pub fn predicate<T: Record + 'static>(&self) -> Predicate<T> {
        if let Some(predicate) = self.predicates.get::<T>() {
            return predicate;
        }
        let predicate = if self.is_complex_query() {
            warn!(
                has_subquery = self.has_subquery(),
                has_join = self.has_join(),
                has_recurve = self.has_recurve(),
                "complex query cannot be evaluated in memory"
            );
            Predicate::constant(false)
        } else {
            let compiled = Predicate::new(compile(self, self.entity_type()));
            debug!(criteria = self.criteria_count(), "predicate compiled");
            compiled
        };
        self.predicates.insert(predicate.clone());
        predicate
    }

    /// Records matching the tree, in input order.
    pub fn filter<'a, T: Record + 'static>(&self, records: &'a [T]) -> Vec<&'a T> {
        self.predicate::<T>().filter(records)
    }

    /// Stable sort by the attached sort specs, first spec first.
    pub fn sort<T: Record>(&self, records: &mut [T]) {
        if self.sorts().is_empty() {
            return;
        }
        let sorts = self.sorts();
        records.sort_by(|a, b| {
            sorts
                .iter()
                .map(|sort| {
                    let (left, right) = (
                        a.field(&sort.field).unwrap_or_default(),
                        b.field(&sort.field).unwrap_or_default(),
                    );
                    let ordering = left.sort_cmp(&right);
                    if sort.desc {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }
}

type Matcher<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

fn compile<T: Record + 'static>(query: &Query, entity_type: Option<&EntityType>) -> Matcher<T> {
    let mut compiled: Vec<(QueryOperator, Matcher<T>)> = Vec::with_capacity(query.entries().len());
    for entry in query.entries() {
        let matcher = match &entry.item {
            QueryItem::Criterion(criterion) => compile_criterion(criterion, entity_type),
            QueryItem::Query(nested) => {
                compile(nested, nested.entity_type().or(entity_type))
            }
        };
        compiled.push((entry.connector, matcher));
    }

    if compiled.is_empty() {
        return Box::new(|_: &T| true);
    }
    Box::new(move |record: &T| {
        let mut entries = compiled.iter();
        let mut result = entries.next().is_some_and(|(_, first)| first(record));
        for (connector, matcher) in entries {
            result = match connector {
                QueryOperator::And => result && matcher(record),
                QueryOperator::Or => result || matcher(record),
            };
        }
        result
    })
}

fn compile_criterion<T: Record + 'static>(
    criterion: &Criterion,
    entity_type: Option<&EntityType>,
) -> Matcher<T> {
    let field = criterion.name().to_string();
    let operator = criterion.operator();
    let value = criterion.value().clone();
    let nullable = entity_type.map_or(true, |entity| entity.is_nullable(&field));

    if !nullable {
        let null_test = match operator {
            CriteriaOperator::IsNull => Some(false),
            CriteriaOperator::NotNull => Some(true),
            CriteriaOperator::Equal if value.is_null() => Some(false),
            CriteriaOperator::NotEqual if value.is_null() => Some(true),
            _ => None,
        };
        if let Some(result) = null_test {
            return Box::new(move |_: &T| result);
        }
    }

    Box::new(move |record: &T| {
        let actual = record.field(&field).unwrap_or_default();
        evaluate(operator, &actual, &value)
    })
}

/// Applies one operator. Negated operators are exact complements.
fn evaluate(operator: CriteriaOperator, actual: &Value, expected: &Value) -> bool {
    use CriteriaOperator::*;

    if operator.is_negative() {
        return !evaluate(operator.negate(), actual, expected);
    }
    let ordering = || actual.compare(expected);
    match operator {
        Equal => actual == expected,
        LessThan => ordering() == Some(Ordering::Less),
        LessThanOrEqual => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        GreaterThan => ordering() == Some(Ordering::Greater),
        GreaterThanOrEqual => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        In => actual.is_in(expected),
        Like => text_test(actual, expected, |a, b| a.contains(b)),
        BeginLike => text_test(actual, expected, |a, b| a.starts_with(b)),
        EndLike => text_test(actual, expected, |a, b| a.ends_with(b)),
        IsNull => actual.is_null(),
        NotEqual | NotIn | NotLike | NotBeginLike | NotEndLike | NotNull => false,
    }
}

fn text_test(actual: &Value, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.as_str(), expected.as_str()) {
        (Some(actual), Some(expected)) => test(actual, expected),
        _ => false,
    }
}
