//! Operator and connector enums used across the criteria tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison applied by a single criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriteriaOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    In,
    NotIn,
    Like,
    NotLike,
    BeginLike,
    NotBeginLike,
    EndLike,
    NotEndLike,
    IsNull,
    NotNull,
}

impl CriteriaOperator {
    /// The logical complement of this operator.
    pub fn negate(self) -> Self {
        use CriteriaOperator::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            LessThan => GreaterThanOrEqual,
            LessThanOrEqual => GreaterThan,
            GreaterThan => LessThanOrEqual,
            GreaterThanOrEqual => LessThan,
            In => NotIn,
            NotIn => In,
            Like => NotLike,
            NotLike => Like,
            BeginLike => NotBeginLike,
            NotBeginLike => BeginLike,
            EndLike => NotEndLike,
            NotEndLike => EndLike,
            IsNull => NotNull,
            NotNull => IsNull,
        }
    }

    /// The operator that keeps the meaning when both operands are swapped,
    /// i.e. `18 < age` is `age > 18`.
    pub fn mirror(self) -> Self {
        use CriteriaOperator::*;
        match self {
            LessThan => GreaterThan,
            LessThanOrEqual => GreaterThanOrEqual,
            GreaterThan => LessThan,
            GreaterThanOrEqual => LessThanOrEqual,
            other => other,
        }
    }

    pub fn is_negative(self) -> bool {
        use CriteriaOperator::*;
        matches!(
            self,
            NotEqual | NotIn | NotLike | NotBeginLike | NotEndLike | NotNull
        )
    }

    /// Symbol used when rendering a query as text.
    pub fn symbol(self) -> &'static str {
        use CriteriaOperator::*;
        match self {
            Equal => "=",
            NotEqual => "<>",
            LessThan => "<",
            LessThanOrEqual => "<=",
            GreaterThan => ">",
            GreaterThanOrEqual => ">=",
            In => "IN",
            NotIn => "NOT IN",
            Like => "LIKE",
            NotLike => "NOT LIKE",
            BeginLike => "BEGIN LIKE",
            NotBeginLike => "NOT BEGIN LIKE",
            EndLike => "END LIKE",
            NotEndLike => "NOT END LIKE",
            IsNull => "IS NULL",
            NotNull => "IS NOT NULL",
        }
    }
}

impl fmt::Display for CriteriaOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Connector between an entry and everything before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryOperator {
    #[default]
    And,
    Or,
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::And => f.write_str("AND"),
            QueryOperator::Or => f.write_str("OR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// Comparison used between the paired fields of a join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinOperator {
    #[default]
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombineType {
    Union,
    UnionAll,
    Except,
    Intersect,
}

/// Traversal direction of a recursive (self-referencing) query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecurveDirection {
    /// Toward the root.
    Up,
    /// Toward the leaves.
    #[default]
    Down,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negate_is_an_involution() {
        use CriteriaOperator::*;
        for op in [
            Equal, NotEqual, LessThan, LessThanOrEqual, GreaterThan, GreaterThanOrEqual, In,
            NotIn, Like, NotLike, BeginLike, NotBeginLike, EndLike, NotEndLike, IsNull, NotNull,
        ] {
            assert_eq!(op.negate().negate(), op);
            assert_ne!(op.negate(), op);
        }
    }

    #[test]
    fn test_mirror() {
        assert_eq!(CriteriaOperator::LessThan.mirror(), CriteriaOperator::GreaterThan);
        assert_eq!(CriteriaOperator::Equal.mirror(), CriteriaOperator::Equal);
    }
}
