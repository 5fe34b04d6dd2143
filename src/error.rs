//! Error types shared by the query builder, translator and manager.

use thiserror::Error;

use crate::token::Span;

/// Errors raised while building, translating or configuring a query.
///
/// None of these are transient: they point at a wiring mistake or a
/// malformed input that has to be fixed at the call site.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// A query model type has no entity type bound in the manager.
    #[error("no entity type is bound to query model `{model}`")]
    MissingEntityBinding { model: String },

    /// An operation needs a query bound to an entity type.
    #[error("{context}: query is not bound to an entity type")]
    MissingEntityType { context: String },

    /// Identity-based conditions need primary keys on the entity.
    #[error("entity `{entity}` does not declare any primary key")]
    MissingPrimaryKeys { entity: String },

    #[error("a query holds at most {limit} joins")]
    TooManyJoins { limit: u16 },

    #[error("invalid recurve criteria: {0}")]
    InvalidRecurve(String),

    #[error("expression is not well formed: {0}")]
    MalformedExpression(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl QueryError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedExpression(message.into())
    }

    pub(crate) fn missing_entity_type(context: impl Into<String>) -> Self {
        Self::MissingEntityType {
            context: context.into(),
        }
    }
}

/// Lambda text could not be tokenized or parsed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    pub(crate) fn new(message: String, span: Option<Span>) -> Self {
        Self { message, span }
    }

    pub(crate) fn at_position(message: String, span: Span) -> Self {
        Self {
            message,
            span: Some(span),
        }
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
