//! Side data attached to a criteria tree: joins, set combinations,
//! recursive criteria, ordering, paging, text override and cancellation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::criterion::FieldConverter;
use crate::error::QueryError;
use crate::operator::{CombineType, JoinOperator, JoinType, RecurveDirection};
use crate::query::Query;
use crate::value::Value;

/// One `source = target` field pair of a join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JoinField {
    pub source: String,
    pub target: String,
}

impl JoinField {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl<S: Into<String>, T: Into<String>> From<(S, T)> for JoinField {
    fn from((source, target): (S, T)) -> Self {
        Self::new(source, target)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinItem {
    /// Ordinal assigned by the owning tree; keeps join order stable.
    pub sort: u16,
    pub join_type: JoinType,
    pub operator: JoinOperator,
    pub fields: Vec<JoinField>,
    pub target: Arc<Query>,
    /// Extra filter applied to the joined rows.
    pub filter: Option<Arc<Query>>,
}

impl JoinItem {
    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            sort: self.sort,
            join_type: self.join_type,
            operator: self.operator,
            fields: self.fields.clone(),
            target: Arc::new(self.target.deep_clone()),
            filter: self
                .filter
                .as_ref()
                .map(|filter| Arc::new(filter.deep_clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CombineItem {
    pub combine_type: CombineType,
    pub query: Arc<Query>,
}

impl CombineItem {
    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            combine_type: self.combine_type,
            query: Arc::new(self.query.deep_clone()),
        }
    }
}

/// Self-join description for walking a parent/child hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecurveCriteria {
    key: String,
    relation_key: String,
    direction: RecurveDirection,
}

impl RecurveCriteria {
    pub fn new(
        key: impl Into<String>,
        relation_key: impl Into<String>,
        direction: RecurveDirection,
    ) -> Result<Self, QueryError> {
        let (key, relation_key) = (key.into(), relation_key.into());
        if key.trim().is_empty() || relation_key.trim().is_empty() {
            return Err(QueryError::InvalidRecurve(
                "key and relation key must not be blank".to_string(),
            ));
        }
        if key == relation_key {
            return Err(QueryError::InvalidRecurve(format!(
                "key and relation key are both `{key}`"
            )));
        }
        Ok(Self {
            key,
            relation_key,
            direction,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn relation_key(&self) -> &str {
        &self.relation_key
    }

    pub fn direction(&self) -> RecurveDirection {
        self.direction
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortEntry {
    pub field: String,
    pub desc: bool,
    pub converter: Option<FieldConverter>,
}

/// Paging window; pages start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Paging {
    pub page: u32,
    pub page_size: u32,
}

impl Paging {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size,
        }
    }

    pub fn skip(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn take(&self) -> u64 {
        u64::from(self.page_size)
    }
}

/// Free-text query that replaces the generated one at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryText {
    pub text: String,
    pub parameters: BTreeMap<String, Value>,
}

/// Cooperative cancellation flag handed to the execution collaborator.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recurve_validation() {
        assert!(RecurveCriteria::new("Id", "Id", RecurveDirection::Down).is_err());
        assert!(RecurveCriteria::new("", "ParentId", RecurveDirection::Down).is_err());
        assert!(RecurveCriteria::new("Id", "  ", RecurveDirection::Up).is_err());

        let recurve = RecurveCriteria::new("Id", "ParentId", RecurveDirection::Up).unwrap();
        assert_eq!(recurve.key(), "Id");
        assert_eq!(recurve.relation_key(), "ParentId");
        assert_eq!(recurve.direction(), RecurveDirection::Up);
    }

    #[test]
    fn test_paging_window() {
        let paging = Paging::new(3, 20);
        assert_eq!(paging.skip(), 40);
        assert_eq!(paging.take(), 20);
        assert_eq!(Paging::new(0, 10).page, 1);
    }

    #[test]
    fn test_cancellation_token_is_shared_by_clones() {
        let token = CancellationToken::new();
        let copy = token.clone();
        assert!(!copy.is_cancelled());
        token.cancel();
        assert!(copy.is_cancelled());
    }
}
