//! The criteria tree.
//!
//! A [`Query`] is an ordered list of `(connector, item)` entries where an
//! item is either a [`Criterion`] or a nested `Query`. Entries are folded
//! left to right: `a AND b OR c` means `(a AND b) OR c`. Besides conditions a
//! tree carries joins, set combinations, recursive criteria, ordering,
//! field selection, paging and a text override.
//!
//! Every combinator funnels into [`Query::add_criterion`] or
//! [`Query::add_item`], which keep the aggregate flags, counters, field
//! names and the equality cache up to date as entries are appended.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::attachment::{
    CancellationToken, CombineItem, JoinField, JoinItem, Paging, QueryText, RecurveCriteria,
    SortEntry,
};
use crate::criterion::{Criterion, CriterionValue, FieldConverter};
use crate::entity::{Entity, EntityType};
use crate::error::{QueryError, Result};
use crate::expr::Lambda;
use crate::operator::{
    CombineType, CriteriaOperator, JoinOperator, JoinType, QueryOperator, RecurveDirection,
};
use crate::predicate::PredicateCache;
use crate::translator;
use crate::value::Value;

/// Child of a criteria tree node.
#[derive(Debug, Clone, Serialize)]
pub enum QueryItem {
    Criterion(Criterion),
    /// Nested tree. Shared trees are never mutated in place.
    Query(Arc<Query>),
}

impl QueryItem {
    fn deep_clone(&self) -> Self {
        match self {
            QueryItem::Criterion(criterion) => QueryItem::Criterion(criterion.deep_clone()),
            QueryItem::Query(query) => QueryItem::Query(Arc::new(query.deep_clone())),
        }
    }
}

impl From<Criterion> for QueryItem {
    fn from(criterion: Criterion) -> Self {
        QueryItem::Criterion(criterion)
    }
}

impl From<Query> for QueryItem {
    fn from(query: Query) -> Self {
        QueryItem::Query(Arc::new(query))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryEntry {
    pub connector: QueryOperator,
    pub item: QueryItem,
}

/// A composable query specification.
///
/// `Clone` is a shallow copy: entry lists are new, nested trees are shared
/// through `Arc` (and thus immutable). [`Query::deep_clone`] detaches every
/// nested tree, join target and subquery; [`Query::light_clone`] keeps only
/// the metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    entries: Vec<QueryEntry>,
    #[serde(skip)]
    equal_criteria: Vec<Criterion>,
    joins: Vec<JoinItem>,
    combines: Vec<CombineItem>,
    recurve: Option<RecurveCriteria>,
    sorts: Vec<SortEntry>,
    query_fields: Vec<String>,
    not_query_fields: Vec<String>,
    paging: Option<Paging>,
    text: Option<QueryText>,
    criteria_count: usize,
    condition_fields: BTreeSet<String>,
    has_subquery: bool,
    has_join: bool,
    has_recurve: bool,
    #[serde(skip)]
    global_condition_applied: bool,
    is_obsolete: bool,
    entity_type: Option<EntityType>,
    #[serde(skip)]
    cancellation_token: Option<CancellationToken>,
    #[serde(skip)]
    copy_parameter_queries: bool,
    #[serde(skip)]
    join_sort: u16,
    #[serde(skip)]
    pub(crate) predicates: PredicateCache,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            equal_criteria: Vec::new(),
            joins: Vec::new(),
            combines: Vec::new(),
            recurve: None,
            sorts: Vec::new(),
            query_fields: Vec::new(),
            not_query_fields: Vec::new(),
            paging: None,
            text: None,
            criteria_count: 0,
            condition_fields: BTreeSet::new(),
            has_subquery: false,
            has_join: false,
            has_recurve: false,
            global_condition_applied: false,
            is_obsolete: false,
            entity_type: None,
            cancellation_token: None,
            copy_parameter_queries: true,
            join_sort: 0,
            predicates: PredicateCache::default(),
        }
    }

    /// A tree bound to an entity type.
    pub fn for_entity(entity_type: EntityType) -> Self {
        let mut query = Self::new();
        query.entity_type = Some(entity_type);
        query
    }

    /// A tree bound to `E`, with the condition translated from `lambda`.
    pub fn from_lambda<E: Entity>(lambda: &Lambda) -> Result<Self> {
        let mut query = Self::for_entity(E::entity_type());
        query.and_expr(lambda)?;
        Ok(query)
    }

    // ---------------------------------------------------------------------
    // accessors
    // ---------------------------------------------------------------------

    pub fn entries(&self) -> &[QueryEntry] {
        &self.entries
    }

    /// Equality criteria whose value is fixed for every match.
    pub fn equal_criteria(&self) -> &[Criterion] {
        &self.equal_criteria
    }

    pub fn joins(&self) -> &[JoinItem] {
        &self.joins
    }

    pub fn combines(&self) -> &[CombineItem] {
        &self.combines
    }

    pub fn recurve(&self) -> Option<&RecurveCriteria> {
        self.recurve.as_ref()
    }

    pub fn sorts(&self) -> &[SortEntry] {
        &self.sorts
    }

    pub fn query_fields(&self) -> &[String] {
        &self.query_fields
    }

    pub fn not_query_fields(&self) -> &[String] {
        &self.not_query_fields
    }

    pub fn paging(&self) -> Option<Paging> {
        self.paging
    }

    pub fn text(&self) -> Option<&QueryText> {
        self.text.as_ref()
    }

    /// Number of atomic conditions, nested trees included.
    pub fn criteria_count(&self) -> usize {
        self.criteria_count
    }

    /// Every field name referenced by a condition, nested trees included.
    pub fn condition_fields(&self) -> &BTreeSet<String> {
        &self.condition_fields
    }

    pub fn has_subquery(&self) -> bool {
        self.has_subquery
    }

    pub fn has_join(&self) -> bool {
        self.has_join
    }

    pub fn has_recurve(&self) -> bool {
        self.has_recurve
    }

    pub fn is_complex_query(&self) -> bool {
        self.has_subquery || self.has_join || self.has_recurve
    }

    pub fn is_obsolete(&self) -> bool {
        self.is_obsolete
    }

    pub fn entity_type(&self) -> Option<&EntityType> {
        self.entity_type.as_ref()
    }

    pub fn set_entity_type(&mut self, entity_type: EntityType) -> &mut Self {
        self.entity_type = Some(entity_type);
        self.invalidate();
        self
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation_token.as_ref()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) -> &mut Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn copy_parameter_queries(&self) -> bool {
        self.copy_parameter_queries
    }

    /// Whether subqueries, join targets and nested trees passed in are
    /// copied before they are attached.
    pub fn set_copy_parameter_queries(&mut self, copy: bool) -> &mut Self {
        self.copy_parameter_queries = copy;
        self
    }

    pub fn global_condition_applied(&self) -> bool {
        self.global_condition_applied
    }

    pub(crate) fn mark_global_condition_applied(&mut self) {
        self.global_condition_applied = true;
    }

    /// Marks the query as cancelled; children are untouched.
    pub fn obsolete(&mut self) -> &mut Self {
        self.is_obsolete = true;
        self
    }

    pub fn activate(&mut self) -> &mut Self {
        self.is_obsolete = false;
        self
    }

    /// Every subquery reachable through criteria of this tree and its nested
    /// trees.
    pub fn subqueries(&self) -> Vec<&Query> {
        let mut found = Vec::new();
        self.collect_subqueries(&mut found);
        found
    }

    fn collect_subqueries<'a>(&'a self, found: &mut Vec<&'a Query>) {
        for entry in &self.entries {
            match &entry.item {
                QueryItem::Criterion(criterion) => {
                    if let Some(query) = criterion.subquery() {
                        found.push(query);
                    }
                }
                QueryItem::Query(query) => query.collect_subqueries(found),
            }
        }
    }

    // ---------------------------------------------------------------------
    // primitives
    // ---------------------------------------------------------------------

    /// Appends `field operator value`. Blank field names are ignored.
    ///
    /// Fails only when `value` is a subquery and this tree is not bound to an
    /// entity type.
    pub fn add_criterion(
        &mut self,
        connector: QueryOperator,
        field: &str,
        operator: CriteriaOperator,
        value: impl Into<CriterionValue>,
        converter: Option<FieldConverter>,
    ) -> Result<&mut Self> {
        if field.trim().is_empty() {
            return Ok(self);
        }
        let criterion = Criterion::new(field, operator, value).with_converter(converter);
        self.add_item(connector, criterion)
    }

    /// Appends a criterion or a nested tree.
    pub fn add_item(
        &mut self,
        connector: QueryOperator,
        item: impl Into<QueryItem>,
    ) -> Result<&mut Self> {
        match item.into() {
            QueryItem::Criterion(criterion) => self.attach_criterion(connector, criterion)?,
            QueryItem::Query(query) => {
                let copy = self.copy_parameter_queries;
                self.attach_query(connector, query, copy);
            }
        }
        Ok(self)
    }

    fn push_literal(
        &mut self,
        connector: QueryOperator,
        field: &str,
        operator: CriteriaOperator,
        value: Value,
        converter: Option<FieldConverter>,
    ) -> &mut Self {
        if field.trim().is_empty() {
            return self;
        }
        let mut criterion = Criterion::new(field, operator, value).with_converter(converter);
        self.track_criterion(connector, &mut criterion);
        self.push_entry(connector, QueryItem::Criterion(criterion));
        self
    }

    fn attach_criterion(&mut self, connector: QueryOperator, mut criterion: Criterion) -> Result<()> {
        if criterion.subquery().is_some() {
            self.register_subquery(&mut criterion)?;
        }
        self.track_criterion(connector, &mut criterion);
        self.push_entry(connector, QueryItem::Criterion(criterion));
        Ok(())
    }

    fn register_subquery(&mut self, criterion: &mut Criterion) -> Result<()> {
        if self.entity_type.is_none() {
            return Err(QueryError::missing_entity_type(format!(
                "subquery on field `{}`",
                criterion.name()
            )));
        }
        let field = criterion.name().to_string();
        let copy = self.copy_parameter_queries;
        let Some(subquery) = criterion.subquery_mut() else {
            return Ok(());
        };
        if copy {
            *subquery = Arc::new(subquery.deep_clone());
        }
        if subquery.query_fields.is_empty() {
            Arc::make_mut(subquery).query_fields = vec![field.clone()];
        }
        self.has_subquery = true;
        self.has_join |= subquery.has_join;
        self.has_recurve |= subquery.has_recurve;
        debug!(field = %field, "subquery attached");
        Ok(())
    }

    /// Bookkeeping for a criterion about to be appended.
    fn track_criterion(&mut self, connector: QueryOperator, criterion: &mut Criterion) {
        if criterion.subquery().is_none() && criterion.value().is_null() {
            match criterion.operator() {
                CriteriaOperator::Equal => criterion.set_operator(CriteriaOperator::IsNull),
                CriteriaOperator::NotEqual => criterion.set_operator(CriteriaOperator::NotNull),
                _ => {}
            }
        }

        let connector = self.effective_connector(connector);
        if connector == QueryOperator::Or {
            // earlier values are no longer fixed
            self.equal_criteria.clear();
        } else if criterion.operator() == CriteriaOperator::Equal && criterion.subquery().is_none()
        {
            self.equal_criteria.push(criterion.clone());
        }

        self.criteria_count += 1;
        self.condition_fields.insert(criterion.name().to_string());
    }

    fn attach_query(&mut self, connector: QueryOperator, mut query: Arc<Query>, copy: bool) {
        if copy {
            query = Arc::new(query.deep_clone());
        }
        self.has_subquery |= query.has_subquery;
        self.has_join |= query.has_join;
        self.has_recurve |= query.has_recurve;
        self.criteria_count += query.criteria_count;
        self.condition_fields
            .extend(query.condition_fields.iter().cloned());

        if self.effective_connector(connector) == QueryOperator::Or {
            self.equal_criteria.clear();
        } else {
            self.equal_criteria
                .extend(query.equal_criteria.iter().cloned());
        }
        self.push_entry(connector, QueryItem::Query(query));
    }

    /// The connector of the first entry has nothing to its left.
    fn effective_connector(&self, connector: QueryOperator) -> QueryOperator {
        if self.entries.is_empty() {
            QueryOperator::And
        } else {
            connector
        }
    }

    fn push_entry(&mut self, connector: QueryOperator, item: QueryItem) {
        self.entries.push(QueryEntry { connector, item });
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.predicates.clear();
    }

    // ---------------------------------------------------------------------
    // fluent combinators
    // ---------------------------------------------------------------------

    pub fn and(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_literal(QueryOperator::And, field, operator, value.into(), None)
    }

    pub fn or(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_literal(QueryOperator::Or, field, operator, value.into(), None)
    }

    pub fn and_with_converter(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        value: impl Into<Value>,
        converter: FieldConverter,
    ) -> &mut Self {
        self.push_literal(
            QueryOperator::And,
            field,
            operator,
            value.into(),
            Some(converter),
        )
    }

    pub fn or_with_converter(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        value: impl Into<Value>,
        converter: FieldConverter,
    ) -> &mut Self {
        self.push_literal(
            QueryOperator::Or,
            field,
            operator,
            value.into(),
            Some(converter),
        )
    }

    pub fn is_null(&mut self, field: &str) -> &mut Self {
        self.and(field, CriteriaOperator::IsNull, Value::Null)
    }

    pub fn or_is_null(&mut self, field: &str) -> &mut Self {
        self.or(field, CriteriaOperator::IsNull, Value::Null)
    }

    pub fn not_null(&mut self, field: &str) -> &mut Self {
        self.and(field, CriteriaOperator::NotNull, Value::Null)
    }

    pub fn or_not_null(&mut self, field: &str) -> &mut Self {
        self.or(field, CriteriaOperator::NotNull, Value::Null)
    }

    /// Appends one nested tree applying `operator value` to every field,
    /// fields joined by `group_connector`, the group joined with AND:
    /// `... AND (a = v OR b = v OR c = v)`.
    pub fn and_group(
        &mut self,
        group_connector: QueryOperator,
        operator: CriteriaOperator,
        value: impl Into<Value>,
        converter: Option<FieldConverter>,
        fields: &[&str],
    ) -> &mut Self {
        self.push_group(
            QueryOperator::And,
            group_connector,
            operator,
            value.into(),
            converter,
            fields,
        )
    }

    /// Like [`Query::and_group`], the group joined with OR.
    pub fn or_group(
        &mut self,
        group_connector: QueryOperator,
        operator: CriteriaOperator,
        value: impl Into<Value>,
        converter: Option<FieldConverter>,
        fields: &[&str],
    ) -> &mut Self {
        self.push_group(
            QueryOperator::Or,
            group_connector,
            operator,
            value.into(),
            converter,
            fields,
        )
    }

    fn push_group(
        &mut self,
        connector: QueryOperator,
        group_connector: QueryOperator,
        operator: CriteriaOperator,
        value: Value,
        converter: Option<FieldConverter>,
        fields: &[&str],
    ) -> &mut Self {
        let mut group = Query::new();
        for field in fields {
            group.push_literal(
                group_connector,
                field,
                operator,
                value.clone(),
                converter.clone(),
            );
        }
        if group.entries.is_empty() {
            return self;
        }
        self.attach_query(connector, Arc::new(group), false);
        self
    }

    /// Appends a nested tree with AND.
    pub fn and_query(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        let copy = self.copy_parameter_queries;
        self.attach_query(QueryOperator::And, query.into(), copy);
        self
    }

    /// Appends a nested tree with OR.
    pub fn or_query(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        let copy = self.copy_parameter_queries;
        self.attach_query(QueryOperator::Or, query.into(), copy);
        self
    }

    /// `field operator (subquery)`.
    pub fn and_subquery(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        subquery: impl Into<Arc<Query>>,
    ) -> Result<&mut Self> {
        self.add_criterion(
            QueryOperator::And,
            field,
            operator,
            CriterionValue::Query(subquery.into()),
            None,
        )
    }

    pub fn or_subquery(
        &mut self,
        field: &str,
        operator: CriteriaOperator,
        subquery: impl Into<Arc<Query>>,
    ) -> Result<&mut Self> {
        self.add_criterion(
            QueryOperator::Or,
            field,
            operator,
            CriterionValue::Query(subquery.into()),
            None,
        )
    }

    pub fn in_query(&mut self, field: &str, subquery: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.and_subquery(field, CriteriaOperator::In, subquery)
    }

    pub fn not_in_query(
        &mut self,
        field: &str,
        subquery: impl Into<Arc<Query>>,
    ) -> Result<&mut Self> {
        self.and_subquery(field, CriteriaOperator::NotIn, subquery)
    }

    /// Appends the condition translated from a predicate lambda with AND.
    pub fn and_expr(&mut self, lambda: &Lambda) -> Result<&mut Self> {
        self.append_lambda(QueryOperator::And, lambda)
    }

    /// Appends the condition translated from a predicate lambda with OR.
    pub fn or_expr(&mut self, lambda: &Lambda) -> Result<&mut Self> {
        self.append_lambda(QueryOperator::Or, lambda)
    }

    fn append_lambda(&mut self, connector: QueryOperator, lambda: &Lambda) -> Result<&mut Self> {
        let (_, item) = translator::translate(lambda)?;
        match item {
            QueryItem::Criterion(criterion) => self.attach_criterion(connector, criterion)?,
            QueryItem::Query(query) => self.attach_query(connector, query, false),
        }
        Ok(self)
    }

    /// AND-equal conditions on every primary key of `entity`.
    pub fn equal_entity_identity<E: Entity>(&mut self, entity: &E) -> Result<&mut Self> {
        let entity_type = E::entity_type();
        if entity_type.primary_keys().is_empty() {
            return Err(QueryError::MissingPrimaryKeys {
                entity: entity_type.name().to_string(),
            });
        }
        for key in entity_type.primary_keys() {
            let value = entity.field(key).unwrap_or_default();
            self.and(key, CriteriaOperator::Equal, value);
        }
        Ok(self)
    }

    // ---------------------------------------------------------------------
    // fixed values
    // ---------------------------------------------------------------------

    /// Values `field` is fixed to by AND-connected equality criteria.
    pub fn fixed_values(&self, field: &str) -> Vec<&Value> {
        self.equal_criteria
            .iter()
            .filter(|criterion| criterion.name() == field)
            .map(Criterion::value)
            .collect()
    }

    /// Primary-key values fixed by this query, for cache keys.
    ///
    /// `Ok(None)` when some key is not fixed to exactly one value.
    pub fn key_values(&self) -> Result<Option<BTreeMap<String, Value>>> {
        let entity_type = self
            .entity_type
            .as_ref()
            .ok_or_else(|| QueryError::missing_entity_type("key values"))?;
        if entity_type.primary_keys().is_empty() {
            return Err(QueryError::MissingPrimaryKeys {
                entity: entity_type.name().to_string(),
            });
        }
        let mut keys = BTreeMap::new();
        for key in entity_type.primary_keys() {
            match self.fixed_values(key).as_slice() {
                [value] => {
                    keys.insert(key.clone(), (*value).clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(keys))
    }

    // ---------------------------------------------------------------------
    // joins, combines, recurve
    // ---------------------------------------------------------------------

    /// Attaches a join. The target must be bound to an entity type.
    pub fn join(
        &mut self,
        join_type: JoinType,
        operator: JoinOperator,
        fields: &[JoinField],
        target: impl Into<Arc<Query>>,
    ) -> Result<&mut Self> {
        self.join_with_filter(join_type, operator, fields, target, None)
    }

    /// Attaches a join whose joined rows are additionally filtered.
    pub fn join_with_filter(
        &mut self,
        join_type: JoinType,
        operator: JoinOperator,
        fields: &[JoinField],
        target: impl Into<Arc<Query>>,
        filter: Option<Query>,
    ) -> Result<&mut Self> {
        let mut target = target.into();
        let Some(target_entity) = target.entity_type().cloned() else {
            return Err(QueryError::missing_entity_type("join target"));
        };
        if self.copy_parameter_queries {
            target = Arc::new(target.deep_clone());
        }
        let sort = self
            .join_sort
            .checked_add(1)
            .ok_or(QueryError::TooManyJoins { limit: u16::MAX })?;
        let filter = filter.map(Arc::new);

        self.join_sort = sort;
        self.has_join = true;
        for query in std::iter::once(&target).chain(filter.as_ref()) {
            self.has_subquery |= query.has_subquery;
            self.has_recurve |= query.has_recurve;
        }
        debug!(
            entity = %target_entity,
            join_type = ?join_type,
            sort = self.join_sort,
            "join attached"
        );
        self.joins.push(JoinItem {
            sort: self.join_sort,
            join_type,
            operator,
            fields: fields.to_vec(),
            target,
            filter,
        });
        self.invalidate();
        Ok(self)
    }

    /// Joins every target with the same field mapping. An empty target list
    /// adds nothing.
    pub fn join_all(
        &mut self,
        join_type: JoinType,
        operator: JoinOperator,
        fields: &[JoinField],
        targets: Vec<Query>,
    ) -> Result<&mut Self> {
        for target in targets {
            self.join(join_type, operator, fields, target)?;
        }
        Ok(self)
    }

    pub fn inner_join(&mut self, fields: &[JoinField], target: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.join(JoinType::Inner, JoinOperator::Equal, fields, target)
    }

    pub fn left_join(&mut self, fields: &[JoinField], target: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.join(JoinType::Left, JoinOperator::Equal, fields, target)
    }

    pub fn right_join(&mut self, fields: &[JoinField], target: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.join(JoinType::Right, JoinOperator::Equal, fields, target)
    }

    pub fn full_join(&mut self, fields: &[JoinField], target: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.join(JoinType::Full, JoinOperator::Equal, fields, target)
    }

    pub fn cross_join(&mut self, target: impl Into<Arc<Query>>) -> Result<&mut Self> {
        self.join(JoinType::Cross, JoinOperator::Equal, &[], target)
    }

    pub fn combine(&mut self, combine_type: CombineType, query: impl Into<Arc<Query>>) -> &mut Self {
        let mut query = query.into();
        if self.copy_parameter_queries {
            query = Arc::new(query.deep_clone());
        }
        self.combines.push(CombineItem {
            combine_type,
            query,
        });
        self
    }

    pub fn union(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        self.combine(CombineType::Union, query)
    }

    pub fn union_all(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        self.combine(CombineType::UnionAll, query)
    }

    pub fn except(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        self.combine(CombineType::Except, query)
    }

    pub fn intersect(&mut self, query: impl Into<Arc<Query>>) -> &mut Self {
        self.combine(CombineType::Intersect, query)
    }

    /// Configures hierarchical traversal over `key` / `relation_key`.
    pub fn set_recurve(
        &mut self,
        key: &str,
        relation_key: &str,
        direction: RecurveDirection,
    ) -> Result<&mut Self> {
        self.recurve = Some(RecurveCriteria::new(key, relation_key, direction)?);
        self.has_recurve = true;
        self.invalidate();
        Ok(self)
    }

    // ---------------------------------------------------------------------
    // ordering, fields, paging, text
    // ---------------------------------------------------------------------

    pub fn order_by(
        &mut self,
        field: &str,
        desc: bool,
        converter: Option<FieldConverter>,
    ) -> &mut Self {
        if !field.trim().is_empty() {
            self.sorts.push(SortEntry {
                field: field.to_string(),
                desc,
                converter,
            });
        }
        self
    }

    pub fn asc(&mut self, field: &str) -> &mut Self {
        self.order_by(field, false, None)
    }

    pub fn desc(&mut self, field: &str) -> &mut Self {
        self.order_by(field, true, None)
    }

    pub fn clear_sort(&mut self) -> &mut Self {
        self.sorts.clear();
        self
    }

    pub fn add_query_fields(&mut self, fields: &[&str]) -> &mut Self {
        push_unique(&mut self.query_fields, fields);
        self
    }

    pub fn add_not_query_fields(&mut self, fields: &[&str]) -> &mut Self {
        push_unique(&mut self.not_query_fields, fields);
        self
    }

    pub fn clear_query_fields(&mut self) -> &mut Self {
        self.query_fields.clear();
        self.not_query_fields.clear();
        self
    }

    /// Fields to select: the explicit list, else the entity's queryable
    /// fields, minus excluded ones.
    pub fn actual_query_fields(&self) -> Vec<String> {
        let candidates: Vec<String> = if self.query_fields.is_empty() {
            self.entity_type
                .as_ref()
                .map(|entity| entity.query_fields().into_iter().map(String::from).collect())
                .unwrap_or_default()
        } else {
            self.query_fields.clone()
        };
        candidates
            .into_iter()
            .filter(|field| !self.not_query_fields.contains(field))
            .collect()
    }

    pub fn set_paging(&mut self, page: u32, page_size: u32) -> &mut Self {
        self.paging = Some(Paging::new(page, page_size));
        self
    }

    pub fn clear_paging(&mut self) -> &mut Self {
        self.paging = None;
        self
    }

    /// Replaces the generated query with `text` at execution time.
    pub fn set_text(
        &mut self,
        text: impl Into<String>,
        parameters: BTreeMap<String, Value>,
    ) -> &mut Self {
        self.text = Some(QueryText {
            text: text.into(),
            parameters,
        });
        self
    }

    // ---------------------------------------------------------------------
    // clones
    // ---------------------------------------------------------------------

    /// A copy sharing nothing with `self`.
    pub fn deep_clone(&self) -> Query {
        let mut copy = self.clone();
        for entry in &mut copy.entries {
            entry.item = entry.item.deep_clone();
        }
        copy.joins = self.joins.iter().map(JoinItem::deep_clone).collect();
        copy.combines = self.combines.iter().map(CombineItem::deep_clone).collect();
        copy
    }

    /// A copy of the metadata without any condition.
    pub fn light_clone(&self) -> Query {
        let mut copy = Query::new();
        copy.joins = self.joins.iter().map(JoinItem::deep_clone).collect();
        copy.combines = self.combines.iter().map(CombineItem::deep_clone).collect();
        copy.recurve = self.recurve.clone();
        copy.sorts = self.sorts.clone();
        copy.query_fields = self.query_fields.clone();
        copy.not_query_fields = self.not_query_fields.clone();
        copy.paging = self.paging;
        copy.text = self.text.clone();
        copy.entity_type = self.entity_type.clone();
        copy.cancellation_token = self.cancellation_token.clone();
        copy.copy_parameter_queries = self.copy_parameter_queries;
        copy.is_obsolete = self.is_obsolete;
        copy.join_sort = self.join_sort;

        copy.has_recurve = copy.recurve.is_some();
        copy.has_join = !copy.joins.is_empty();
        for join in &copy.joins {
            for query in std::iter::once(&join.target).chain(join.filter.as_ref()) {
                copy.has_subquery |= query.has_subquery;
                copy.has_recurve |= query.has_recurve;
            }
        }
        copy
    }
}

fn push_unique(target: &mut Vec<String>, fields: &[&str]) {
    for field in fields {
        let field = field.trim();
        if !field.is_empty() && !target.iter().any(|existing| existing == field) {
            target.push(field.to_string());
        }
    }
}

macro_rules! criteria_shortcuts {
    ($($operator:ident => $and:ident, $or:ident;)*) => {
        impl Query {
            $(
                #[doc = concat!("`AND field ", stringify!($operator), " value`.")]
                pub fn $and(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
                    self.and(field, CriteriaOperator::$operator, value)
                }

                #[doc = concat!("`OR field ", stringify!($operator), " value`.")]
                pub fn $or(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
                    self.or(field, CriteriaOperator::$operator, value)
                }
            )*
        }
    };
}

criteria_shortcuts! {
    Equal => equal, or_equal;
    NotEqual => not_equal, or_not_equal;
    LessThan => less_than, or_less_than;
    LessThanOrEqual => less_than_or_equal, or_less_than_or_equal;
    GreaterThan => greater_than, or_greater_than;
    GreaterThanOrEqual => greater_than_or_equal, or_greater_than_or_equal;
    In => in_values, or_in_values;
    NotIn => not_in, or_not_in;
    Like => like, or_like;
    NotLike => not_like, or_not_like;
    BeginLike => begin_like, or_begin_like;
    NotBeginLike => not_begin_like, or_not_begin_like;
    EndLike => end_like, or_end_like;
    NotEndLike => not_end_like, or_not_end_like;
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", entry.connector)?;
            }
            match &entry.item {
                QueryItem::Criterion(criterion) => write!(f, "{criterion}")?,
                QueryItem::Query(query) => write!(f, "({query})")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldInfo;

    fn user_type() -> EntityType {
        EntityType::builder("User")
            .primary_key("Id")
            .field(FieldInfo::new("Name"))
            .field(FieldInfo::new("Age").required())
            .field(FieldInfo::new("Status").required())
            .field(FieldInfo::new("ParentId"))
            .field(FieldInfo::new("Password").hidden())
            .build()
    }

    fn role_type() -> EntityType {
        EntityType::builder("Role")
            .primary_key("Id")
            .field(FieldInfo::new("UserId"))
            .build()
    }

    #[test]
    fn test_blank_field_is_ignored() {
        let mut query = Query::new();
        query.equal("", 1).equal("   ", 2);
        assert!(query.entries().is_empty());
        assert_eq!(query.criteria_count(), 0);
    }

    #[test]
    fn test_simple_and() {
        let mut query = Query::new();
        query.equal("Status", 1).greater_than("Age", 18);

        assert_eq!(query.entries().len(), 2);
        assert_eq!(query.criteria_count(), 2);
        assert_eq!(query.to_string(), "Status = 1 AND Age > 18");
        assert!(query.condition_fields().contains("Age"));
    }

    #[test]
    fn test_null_equality_is_rewritten() {
        let mut query = Query::new();
        query.equal("Name", Value::Null).not_equal("Email", Value::Null);

        let operators: Vec<_> = query
            .entries()
            .iter()
            .map(|entry| match &entry.item {
                QueryItem::Criterion(criterion) => criterion.operator(),
                QueryItem::Query(_) => panic!("Expected criterion"),
            })
            .collect();
        assert_eq!(operators, vec![CriteriaOperator::IsNull, CriteriaOperator::NotNull]);
        assert_eq!(query.to_string(), "Name IS NULL AND Email IS NOT NULL");
    }

    #[test]
    fn test_grouped_or_is_one_item() {
        let mut query = Query::new();
        query
            .and_group(
                QueryOperator::Or,
                CriteriaOperator::Equal,
                "x",
                None,
                &["FieldA", "FieldB", "FieldC"],
            )
            .equal("Status", 1);

        assert_eq!(query.entries().len(), 2);
        let QueryItem::Query(group) = &query.entries()[0].item else {
            panic!("Expected grouped sub-tree");
        };
        let connectors: Vec<_> = group.entries().iter().map(|e| e.connector).collect();
        assert_eq!(
            connectors,
            vec![QueryOperator::Or, QueryOperator::Or, QueryOperator::Or]
        );
        assert_eq!(query.entries()[1].connector, QueryOperator::And);
        assert_eq!(query.criteria_count(), 4);
        assert_eq!(
            query.to_string(),
            "(FieldA = 'x' OR FieldB = 'x' OR FieldC = 'x') AND Status = 1"
        );
    }

    #[test]
    fn test_grouped_with_blank_fields_adds_nothing() {
        let mut query = Query::new();
        query.or_group(QueryOperator::And, CriteriaOperator::Equal, 1, None, &["", " "]);
        assert!(query.entries().is_empty());
    }

    #[test]
    fn test_equal_criteria_cache() {
        let mut query = Query::for_entity(user_type());
        query.equal("Id", 5).equal("Status", 1);
        assert_eq!(query.fixed_values("Id"), vec![&Value::Int(5)]);
        assert_eq!(
            query.key_values().unwrap(),
            Some(BTreeMap::from([("Id".to_string(), Value::Int(5))]))
        );

        query.or_equal("Id", 6);
        assert!(query.fixed_values("Id").is_empty());
        assert_eq!(query.key_values().unwrap(), None);

        query.equal("Id", 7);
        assert_eq!(query.fixed_values("Id"), vec![&Value::Int(7)]);
    }

    #[test]
    fn test_first_or_entry_still_counts_as_fixed() {
        let mut query = Query::new();
        query.or_equal("Id", 1);
        assert_eq!(query.fixed_values("Id"), vec![&Value::Int(1)]);
    }

    #[test]
    fn test_key_values_requires_metadata() {
        assert!(matches!(
            Query::new().key_values(),
            Err(QueryError::MissingEntityType { .. })
        ));
        let keyless = Query::for_entity(EntityType::builder("Log").build());
        assert!(matches!(
            keyless.key_values(),
            Err(QueryError::MissingPrimaryKeys { .. })
        ));
    }

    #[test]
    fn test_subquery_requires_bound_entity_type() {
        let mut sub = Query::for_entity(role_type());
        sub.equal("Id", 1);

        let mut unbound = Query::new();
        assert!(matches!(
            unbound.in_query("Id", sub.clone()),
            Err(QueryError::MissingEntityType { .. })
        ));
        assert!(unbound.entries().is_empty());

        let mut query = Query::for_entity(user_type());
        query.in_query("Id", sub).unwrap();
        assert!(query.has_subquery());
        assert!(query.is_complex_query());
        let subqueries = query.subqueries();
        assert_eq!(subqueries.len(), 1);
        assert_eq!(subqueries[0].query_fields(), ["Id".to_string()]);
    }

    #[test]
    fn test_subquery_keeps_declared_fields() {
        let mut sub = Query::for_entity(role_type());
        sub.add_query_fields(&["UserId"]);
        let mut query = Query::for_entity(user_type());
        query.in_query("Id", sub).unwrap();
        assert_eq!(query.subqueries()[0].query_fields(), ["UserId".to_string()]);
    }

    #[test]
    fn test_flags_propagate_through_nested_trees() {
        let mut sub = Query::for_entity(role_type());
        sub.set_recurve("Id", "ParentId", RecurveDirection::Down).unwrap();

        let mut inner = Query::for_entity(user_type());
        inner.in_query("Id", sub).unwrap();
        assert!(inner.has_subquery());
        assert!(inner.has_recurve());
        assert!(!inner.has_join());

        let mut outer = Query::new();
        outer.equal("Status", 1).and_query(inner);
        assert!(outer.has_subquery());
        assert!(outer.has_recurve());
        assert!(outer.is_complex_query());
    }

    #[test]
    fn test_join_requires_target_entity_type() {
        let mut query = Query::for_entity(user_type());
        let fields = [JoinField::new("Id", "UserId")];
        assert!(matches!(
            query.inner_join(&fields, Query::new()),
            Err(QueryError::MissingEntityType { .. })
        ));
        assert!(!query.has_join());

        query.inner_join(&fields, Query::for_entity(role_type())).unwrap();
        query.left_join(&fields, Query::for_entity(role_type())).unwrap();
        assert!(query.has_join());
        let sorts: Vec<_> = query.joins().iter().map(|join| join.sort).collect();
        assert_eq!(sorts, vec![1, 2]);
        assert_eq!(query.joins()[1].join_type, JoinType::Left);
    }

    #[test]
    fn test_join_propagates_target_flags() {
        let mut target = Query::for_entity(role_type());
        target.set_recurve("Id", "ParentId", RecurveDirection::Up).unwrap();

        let mut query = Query::for_entity(user_type());
        query
            .join(JoinType::Inner, JoinOperator::Equal, &[("Id", "UserId").into()], target)
            .unwrap();
        assert!(query.has_join());
        assert!(query.has_recurve());
    }

    #[test]
    fn test_join_filter_propagates_flags_and_is_copied() {
        let mut filter = Query::for_entity(role_type());
        filter.set_recurve("Id", "ParentId", RecurveDirection::Down).unwrap();
        filter.equal("UserId", 3);

        let mut query = Query::for_entity(user_type());
        query
            .join_with_filter(
                JoinType::Left,
                JoinOperator::Equal,
                &[("Id", "UserId").into()],
                Query::for_entity(role_type()),
                Some(filter),
            )
            .unwrap();
        assert!(query.has_join());
        assert!(query.has_recurve());
        assert!(!query.has_subquery());

        let copy = query.deep_clone();
        let (Some(original), Some(copied)) = (&query.joins()[0].filter, &copy.joins()[0].filter)
        else {
            panic!("join filter missing");
        };
        assert!(!Arc::ptr_eq(original, copied));
        assert_eq!(copied.to_string(), "UserId = 3");
        assert!(copied.has_recurve());
    }

    #[test]
    fn test_join_ordinal_overflow_is_an_error() {
        let mut query = Query::for_entity(user_type());
        query.join_sort = u16::MAX;
        let result = query.inner_join(&[("Id", "UserId").into()], Query::for_entity(role_type()));
        assert!(matches!(result, Err(QueryError::TooManyJoins { .. })));
        assert!(query.joins().is_empty());
        assert!(!query.has_join());
    }

    #[test]
    fn test_join_all_with_no_targets_is_noop() {
        let mut query = Query::for_entity(user_type());
        query
            .join_all(JoinType::Inner, JoinOperator::Equal, &[], Vec::new())
            .unwrap();
        assert!(!query.has_join());
        assert!(query.joins().is_empty());
    }

    #[test]
    fn test_recurve_validation() {
        let mut query = Query::for_entity(user_type());
        assert!(matches!(
            query.set_recurve("Id", "Id", RecurveDirection::Down),
            Err(QueryError::InvalidRecurve(_))
        ));
        assert!(!query.has_recurve());

        query.set_recurve("Id", "ParentId", RecurveDirection::Down).unwrap();
        assert!(query.has_recurve());
        assert_eq!(query.recurve().map(RecurveCriteria::key), Some("Id"));
    }

    #[test]
    fn test_deep_clone_isolation() {
        let mut sub = Query::for_entity(role_type());
        sub.equal("UserId", 3);
        let mut original = Query::for_entity(user_type());
        original
            .equal("Status", 1)
            .in_query("Id", sub)
            .unwrap();
        original
            .inner_join(&[JoinField::new("Id", "UserId")], Query::for_entity(role_type()))
            .unwrap();

        let mut copy = original.deep_clone();
        copy.equal("Age", 30).asc("Name").set_paging(2, 10);
        let QueryItem::Criterion(criterion) = &copy.entries()[1].item else {
            panic!("Expected subquery criterion");
        };
        let copied_sub = criterion.subquery().unwrap();
        let QueryItem::Criterion(criterion) = &original.entries()[1].item else {
            panic!("Expected subquery criterion");
        };
        let original_sub = criterion.subquery().unwrap();
        assert!(!std::ptr::eq(copied_sub, original_sub));
        assert!(!Arc::ptr_eq(&copy.joins()[0].target, &original.joins()[0].target));

        assert_eq!(original.entries().len(), 2);
        assert_eq!(original.criteria_count(), 2);
        assert!(original.sorts().is_empty());
        assert!(original.paging().is_none());
        assert_eq!(copy.criteria_count(), 3);

        original.equal("Name", "Ann");
        assert_eq!(copy.entries().len(), 3);
        assert!(!copy.condition_fields().contains("Name"));
    }

    #[test]
    fn test_shallow_clone_shares_nested_trees() {
        let mut inner = Query::new();
        inner.equal("A", 1);
        let mut query = Query::new();
        query.and_query(inner);

        let copy = query.clone();
        let (QueryItem::Query(a), QueryItem::Query(b)) =
            (&query.entries()[0].item, &copy.entries()[0].item)
        else {
            panic!("Expected nested trees");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_parameter_queries_are_copied_when_switched_on() {
        let inner = Arc::new({
            let mut q = Query::new();
            q.equal("A", 1);
            q
        });

        let mut copying = Query::new();
        copying.and_query(Arc::clone(&inner));
        let QueryItem::Query(attached) = &copying.entries()[0].item else {
            panic!("Expected nested tree");
        };
        assert!(!Arc::ptr_eq(attached, &inner));

        let mut sharing = Query::new();
        sharing.set_copy_parameter_queries(false).and_query(Arc::clone(&inner));
        let QueryItem::Query(attached) = &sharing.entries()[0].item else {
            panic!("Expected nested tree");
        };
        assert!(Arc::ptr_eq(attached, &inner));
    }

    #[test]
    fn test_light_clone_drops_conditions() {
        let mut query = Query::for_entity(user_type());
        query
            .equal("Status", 1)
            .desc("Age")
            .add_query_fields(&["Id", "Name"])
            .set_paging(1, 20);
        query.set_recurve("Id", "ParentId", RecurveDirection::Up).unwrap();

        let copy = query.light_clone();
        assert!(copy.entries().is_empty());
        assert_eq!(copy.criteria_count(), 0);
        assert_eq!(copy.sorts().len(), 1);
        assert_eq!(copy.query_fields().len(), 2);
        assert_eq!(copy.paging(), Some(Paging::new(1, 20)));
        assert!(copy.has_recurve());
        assert_eq!(copy.entity_type(), query.entity_type());
    }

    #[test]
    fn test_obsolete_and_activate() {
        let mut query = Query::new();
        query.equal("A", 1).obsolete();
        assert!(query.is_obsolete());
        assert_eq!(query.entries().len(), 1);
        query.activate();
        assert!(!query.is_obsolete());
    }

    #[test]
    fn test_actual_query_fields() {
        let mut query = Query::for_entity(user_type());
        assert_eq!(
            query.actual_query_fields(),
            vec!["Id", "Name", "Age", "Status", "ParentId"]
        );
        query.add_not_query_fields(&["Age"]);
        assert_eq!(query.actual_query_fields(), vec!["Id", "Name", "Status", "ParentId"]);
        query.add_query_fields(&["Id", "Age", "Id"]);
        assert_eq!(query.actual_query_fields(), vec!["Id"]);
    }

    #[test]
    fn test_combine_and_text() {
        let mut query = Query::for_entity(user_type());
        query
            .union(Query::for_entity(user_type()))
            .except(Query::for_entity(user_type()))
            .set_text("select 1", BTreeMap::new());
        let kinds: Vec<_> = query.combines().iter().map(|c| c.combine_type).collect();
        assert_eq!(kinds, vec![CombineType::Union, CombineType::Except]);
        assert_eq!(query.text().map(|t| t.text.as_str()), Some("select 1"));
        assert!(!query.is_complex_query());
    }

    struct User {
        id: i64,
    }

    impl crate::entity::Record for User {
        fn field(&self, name: &str) -> Option<Value> {
            (name == "Id").then_some(Value::Int(self.id))
        }
    }

    impl Entity for User {
        fn entity_type() -> EntityType {
            user_type()
        }
    }

    struct Log;

    impl crate::entity::Record for Log {
        fn field(&self, _name: &str) -> Option<Value> {
            None
        }
    }

    impl Entity for Log {
        fn entity_type() -> EntityType {
            EntityType::builder("Log").build()
        }
    }

    #[test]
    fn test_equal_entity_identity() {
        let mut query = Query::for_entity(user_type());
        query.equal_entity_identity(&User { id: 9 }).unwrap();
        assert_eq!(query.to_string(), "Id = 9");

        let mut query = Query::new();
        assert!(matches!(
            query.equal_entity_identity(&Log),
            Err(QueryError::MissingPrimaryKeys { .. })
        ));
    }

    #[test]
    fn test_serialize_tree() {
        let mut query = Query::for_entity(user_type());
        query.equal("Status", 1).asc("Name");
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["entity_type"], "User");
        assert_eq!(json["entries"][0]["connector"], "And");
        assert_eq!(json["entries"][0]["item"]["Criterion"]["name"], "Status");
        assert_eq!(json["sorts"][0]["field"], "Name");
    }
}
