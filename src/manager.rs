//! Query construction and global conditions.
//!
//! A [`QueryManager`] knows which entity type each query model reads and a
//! list of [`GlobalConditionProvider`]s (tenant filters, soft-delete flags
//! and the like). Registration takes `&mut self`; once configured the manager
//! is shared by reference.

use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::config::QueryConfig;
use crate::entity::{Entity, EntityType};
use crate::error::{QueryError, Result};
use crate::expr::{Bindings, Lambda};
use crate::operator::QueryOperator;
use crate::query::Query;

/// What a query is about to be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum UsageScene {
    #[default]
    Query,
    Update,
    Delete,
    Display,
}

/// Input handed to every provider.
#[derive(Debug)]
pub struct GlobalConditionContext<'a> {
    pub entity_type: &'a EntityType,
    pub usage_scene: UsageScene,
    /// Name of the component issuing the query, if known.
    pub source_type: Option<&'a str>,
    pub query: &'a Query,
}

/// A condition to merge into a query, with the connector to use.
#[derive(Debug, Clone)]
pub struct GlobalCondition {
    pub connector: QueryOperator,
    pub query: Query,
}

impl GlobalCondition {
    pub fn and(query: Query) -> Self {
        Self {
            connector: QueryOperator::And,
            query,
        }
    }

    pub fn or(query: Query) -> Self {
        Self {
            connector: QueryOperator::Or,
            query,
        }
    }
}

pub trait GlobalConditionProvider: Send + Sync {
    /// The condition to apply, or `None` when nothing applies.
    fn condition(&self, context: &GlobalConditionContext<'_>) -> Option<GlobalCondition>;
}

impl<F> GlobalConditionProvider for F
where
    F: Fn(&GlobalConditionContext<'_>) -> Option<GlobalCondition> + Send + Sync,
{
    fn condition(&self, context: &GlobalConditionContext<'_>) -> Option<GlobalCondition> {
        self(context)
    }
}

#[derive(Default)]
pub struct QueryManager {
    config: QueryConfig,
    bindings: HashMap<TypeId, EntityType>,
    providers: Vec<Box<dyn GlobalConditionProvider>>,
}

impl fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryManager")
            .field("config", &self.config)
            .field("bindings", &self.bindings.len())
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: QueryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Binds an entity type to itself as query model.
    pub fn register_entity<E: Entity>(&mut self) -> &mut Self {
        self.bind_query_model::<E>(E::entity_type())
    }

    /// Binds query model `M` to the entity type it reads.
    pub fn bind_query_model<M: 'static>(&mut self, entity_type: EntityType) -> &mut Self {
        debug!(model = type_name::<M>(), entity = %entity_type, "query model bound");
        self.bindings.insert(TypeId::of::<M>(), entity_type);
        self
    }

    pub fn add_global_condition_provider(
        &mut self,
        provider: impl GlobalConditionProvider + 'static,
    ) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// The entity type bound to query model `M`.
    pub fn entity_type_of<M: 'static>(&self) -> Result<EntityType> {
        self.bindings
            .get(&TypeId::of::<M>())
            .cloned()
            .ok_or_else(|| QueryError::MissingEntityBinding {
                model: type_name::<M>().to_string(),
            })
    }

    /// An unbound query.
    pub fn create(&self) -> Query {
        let mut query = Query::new();
        query.set_copy_parameter_queries(self.config.copy_parameter_queries);
        query
    }

    /// A query bound to the entity type of model `M`.
    pub fn create_for<M: 'static>(&self) -> Result<Query> {
        let mut query = self.create();
        query.set_entity_type(self.entity_type_of::<M>()?);
        Ok(query)
    }

    /// A query for model `M` with the condition translated from `lambda`.
    pub fn create_with<M: 'static>(&self, lambda: &Lambda) -> Result<Query> {
        let mut query = self.create_for::<M>()?;
        query.and_expr(lambda)?;
        Ok(query)
    }

    /// Like [`QueryManager::create_with`], parsing the lambda from text.
    pub fn create_from_text<M: 'static>(&self, text: &str, bindings: &Bindings) -> Result<Query> {
        let lambda = Lambda::parse_with(text, bindings)?;
        self.create_with::<M>(&lambda)
    }

    /// Merges every provider's condition into `query`, once.
    ///
    /// Queries without an entity type are left alone.
    pub fn apply_global_condition(
        &self,
        query: &mut Query,
        usage_scene: UsageScene,
        source_type: Option<&str>,
    ) {
        if query.global_condition_applied() {
            return;
        }
        let Some(entity_type) = query.entity_type().cloned() else {
            return;
        };

        let conditions: Vec<GlobalCondition> = {
            let context = GlobalConditionContext {
                entity_type: &entity_type,
                usage_scene,
                source_type,
                query: &*query,
            };
            self.providers
                .iter()
                .filter_map(|provider| provider.condition(&context))
                .collect()
        };

        for condition in conditions {
            if condition.query.entries().is_empty() {
                continue;
            }
            debug!(
                entity = %entity_type,
                scene = ?usage_scene,
                connector = %condition.connector,
                condition = %condition.query,
                "global condition merged"
            );
            match condition.connector {
                QueryOperator::And => query.and_query(condition.query),
                QueryOperator::Or => query.or_query(condition.query),
            };
        }
        query.mark_global_condition_applied();
    }
}
