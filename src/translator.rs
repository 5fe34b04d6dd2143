//! Translation of predicate expressions into criteria trees.
//!
//! Supported shapes:
//!
//! * comparisons between a member of the parameter and a value,
//!   `x.Age > 18` or `18 < x.Age`;
//! * `&&` / `||`, each producing a nested tree;
//! * string methods on a member (`StartsWith`, `EndsWith`, `Contains`,
//!   `Equals`);
//! * collection membership, `ids.Contains(x.Id)` or `Contains(ids, x.Id)`;
//! * bare boolean members and `!` over any of the above.
//!
//! Everything else is rejected with [`QueryError::MalformedExpression`].

use std::sync::Arc;
use tracing::debug;

use crate::criterion::{Criterion, CriterionValue};
use crate::error::{QueryError, Result};
use crate::expr::{BinaryOp, Expr, Lambda};
use crate::operator::{CriteriaOperator, QueryOperator};
use crate::query::{Query, QueryItem};
use crate::value::Value;

/// Translates a lambda into the connector and item to attach.
pub fn translate(lambda: &Lambda) -> Result<(QueryOperator, QueryItem)> {
    let result = translate_body(lambda.body(), lambda.parameter())?;
    debug!(lambda = %lambda, "expression translated");
    Ok(result)
}

/// Translates a boolean expression over the named parameter.
pub fn translate_body(body: &Expr, parameter: &str) -> Result<(QueryOperator, QueryItem)> {
    Translator { parameter }.visit(body)
}

struct Translator<'a> {
    parameter: &'a str,
}

impl Translator<'_> {
    fn visit(&self, expr: &Expr) -> Result<(QueryOperator, QueryItem)> {
        match expr {
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.comparison(*op, left, right)
            }
            Expr::Binary {
                op: op @ (BinaryOp::AndAlso | BinaryOp::OrElse),
                left,
                right,
            } => self.connective(*op, left, right),
            Expr::Call {
                target,
                method,
                args,
            } => self.call(target.as_deref(), method, args),
            Expr::Not(inner) => self.not(inner),
            Expr::Convert(inner) => self.visit(inner),
            Expr::Member { .. } => {
                let name = self.field_name(expr)?;
                Ok(criterion(name, CriteriaOperator::Equal, Value::Bool(true)))
            }
            other => Err(QueryError::malformed(format!(
                "`{other}` is not a condition"
            ))),
        }
    }

    fn comparison(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(QueryOperator, QueryItem)> {
        let name_on_left = match (self.is_name(left), self.is_name(right)) {
            (true, true) => {
                left.innermost().node_type().ordinal() >= right.innermost().node_type().ordinal()
            }
            (true, false) => true,
            (false, true) => false,
            (false, false) => {
                return Err(QueryError::malformed(format!(
                    "neither `{left}` nor `{right}` is a field"
                )));
            }
        };
        let (name, value) = if name_on_left {
            (left, right)
        } else {
            (right, left)
        };

        let operator = comparison_operator(op);
        let operator = if name_on_left {
            operator
        } else {
            operator.mirror()
        };
        let name = self.field_name(name)?;
        let value = self.value_of(value)?;
        Ok(criterion(name, operator, value))
    }

    fn connective(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(QueryOperator, QueryItem)> {
        let connector = if op == BinaryOp::OrElse {
            QueryOperator::Or
        } else {
            QueryOperator::And
        };
        let (_, left) = self.visit(left)?;
        let (_, right) = self.visit(right)?;

        let mut group = Query::new();
        group.set_copy_parameter_queries(false);
        group.add_item(QueryOperator::And, left)?;
        group.add_item(connector, right)?;
        Ok((QueryOperator::And, QueryItem::Query(Arc::new(group))))
    }

    fn call(&self, target: Option<&Expr>, method: &str, args: &[Expr]) -> Result<(QueryOperator, QueryItem)> {
        match (target, method, args) {
            (Some(receiver), "StartsWith" | "EndsWith" | "Contains" | "Equals", [arg])
                if self.is_name(receiver) =>
            {
                let operator = match method {
                    "StartsWith" => CriteriaOperator::BeginLike,
                    "EndsWith" => CriteriaOperator::EndLike,
                    "Contains" => CriteriaOperator::Like,
                    _ => CriteriaOperator::Equal,
                };
                let name = self.field_name(receiver)?;
                Ok(criterion(name, operator, self.value_of(arg)?))
            }
            (Some(collection), "Contains", [item]) | (None, "Contains", [collection, item]) => {
                let name = self.field_name(item)?;
                Ok(criterion(name, CriteriaOperator::In, self.collection(collection)?))
            }
            _ => Err(QueryError::malformed(format!(
                "method `{method}` cannot be translated"
            ))),
        }
    }

    fn not(&self, inner: &Expr) -> Result<(QueryOperator, QueryItem)> {
        match inner {
            Expr::Not(twice) => self.visit(twice),
            Expr::Call { .. }
            | Expr::Binary {
                op: BinaryOp::Equal | BinaryOp::NotEqual,
                ..
            } => {
                let (connector, item) = self.visit(inner)?;
                Ok((connector, negate(item)?))
            }
            // null members count as false, so `!x.Active` is `Active <> true`
            Expr::Member { .. } | Expr::Convert(_) => {
                let name = self.field_name(inner)?;
                Ok(criterion(name, CriteriaOperator::NotEqual, Value::Bool(true)))
            }
            other => Err(QueryError::malformed(format!("`!{other}` cannot be negated"))),
        }
    }

    /// A member access (possibly converted) on some target.
    fn is_name(&self, expr: &Expr) -> bool {
        expr.as_member().is_some()
    }

    /// The field name of a direct member of the lambda parameter.
    fn field_name(&self, expr: &Expr) -> Result<String> {
        match expr.as_member() {
            Some((Expr::Parameter(parameter), name)) if parameter == self.parameter => {
                Ok(name.to_string())
            }
            _ => Err(QueryError::malformed(format!(
                "`{expr}` is not a field of `{}`",
                self.parameter
            ))),
        }
    }

    fn value_of(&self, expr: &Expr) -> Result<CriterionValue> {
        if expr.references_parameter() {
            return Err(QueryError::malformed(format!(
                "value `{expr}` depends on `{}`",
                self.parameter
            )));
        }
        Ok(CriterionValue::from(expr.clone()))
    }

    fn collection(&self, expr: &Expr) -> Result<CriterionValue> {
        if expr.references_parameter() {
            return Err(QueryError::malformed(format!(
                "collection `{expr}` depends on `{}`",
                self.parameter
            )));
        }
        match expr.evaluate() {
            Some(list @ Value::List(_)) => Ok(CriterionValue::Literal(list)),
            _ => Err(QueryError::malformed(format!(
                "`{expr}` is not a collection"
            ))),
        }
    }
}

fn comparison_operator(op: BinaryOp) -> CriteriaOperator {
    match op {
        BinaryOp::NotEqual => CriteriaOperator::NotEqual,
        BinaryOp::LessThan => CriteriaOperator::LessThan,
        BinaryOp::LessThanOrEqual => CriteriaOperator::LessThanOrEqual,
        BinaryOp::GreaterThan => CriteriaOperator::GreaterThan,
        BinaryOp::GreaterThanOrEqual => CriteriaOperator::GreaterThanOrEqual,
        _ => CriteriaOperator::Equal,
    }
}

fn criterion(name: String, operator: CriteriaOperator, value: impl Into<CriterionValue>) -> (QueryOperator, QueryItem) {
    (
        QueryOperator::And,
        QueryItem::Criterion(Criterion::new(name, operator, value)),
    )
}

fn negate(item: QueryItem) -> Result<QueryItem> {
    match item {
        QueryItem::Criterion(mut criterion) => {
            let operator = criterion.operator().negate();
            criterion.set_operator(operator);
            Ok(QueryItem::Criterion(criterion))
        }
        QueryItem::Query(query) => Err(QueryError::malformed(format!(
            "group `{query}` cannot be negated"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Document, EntityType, FieldInfo};
    use crate::expr::Bindings;
    use proptest::prelude::*;

    fn x() -> Expr {
        Expr::param("x")
    }

    fn single(lambda: &Lambda) -> Criterion {
        match translate(lambda).unwrap().1 {
            QueryItem::Criterion(criterion) => criterion,
            QueryItem::Query(query) => panic!("Expected criterion, got group {query}"),
        }
    }

    #[test]
    fn test_simple_comparison() {
        let lambda = Lambda::new("x", x().member("Age").greater_than(Expr::constant(18)));
        let criterion = single(&lambda);
        assert_eq!(criterion.name(), "Age");
        assert_eq!(criterion.operator(), CriteriaOperator::GreaterThan);
        assert_eq!(criterion.value(), &Value::Int(18));
    }

    #[test]
    fn test_name_on_the_right_is_mirrored() {
        let lambda = Lambda::new("x", Expr::constant(18).less_than(x().member("Age")));
        let criterion = single(&lambda);
        assert_eq!(criterion.name(), "Age");
        assert_eq!(criterion.operator(), CriteriaOperator::GreaterThan);
    }

    #[test]
    fn test_parameter_member_wins_over_captured_member() {
        let limit = Expr::constant(Value::Map([("Age".to_string(), Value::Int(21))].into()));
        let lambda = Lambda::new("x", limit.member("Age").less_or_equal(x().member("Age").convert()));
        let criterion = single(&lambda);
        assert_eq!(criterion.name(), "Age");
        assert_eq!(criterion.operator(), CriteriaOperator::GreaterThanOrEqual);
        assert_eq!(criterion.value(), &Value::Int(21));
    }

    #[test]
    fn test_two_parameter_members_are_malformed() {
        let lambda = Lambda::new("x", x().member("Age").equal(x().member("Score")));
        assert!(matches!(
            translate(&lambda),
            Err(QueryError::MalformedExpression(_))
        ));
    }

    #[test]
    fn test_constant_only_comparison_is_malformed() {
        let lambda = Lambda::new("x", Expr::constant(1).equal(Expr::constant(1)));
        let err = translate(&lambda).unwrap_err();
        assert!(err.to_string().starts_with("expression is not well formed"));
    }

    #[test]
    fn test_connective_builds_group() {
        let lambda = Lambda::parse(r#"x => x.Age > 18 || x.Name.StartsWith("A")"#).unwrap();
        let (connector, item) = translate(&lambda).unwrap();
        assert_eq!(connector, QueryOperator::And);
        let QueryItem::Query(group) = item else {
            panic!("Expected group");
        };
        assert_eq!(group.entries().len(), 2);
        assert_eq!(group.entries()[1].connector, QueryOperator::Or);
        assert_eq!(group.to_string(), "Age > 18 OR Name BEGIN LIKE 'A'");
    }

    #[test]
    fn test_string_methods() {
        let cases = [
            ("StartsWith", CriteriaOperator::BeginLike),
            ("EndsWith", CriteriaOperator::EndLike),
            ("Contains", CriteriaOperator::Like),
            ("Equals", CriteriaOperator::Equal),
        ];
        for (method, expected) in cases {
            let body = x().member("Name").call(method, vec![Expr::constant("a")]);
            let criterion = single(&Lambda::new("x", body.clone()));
            assert_eq!(criterion.operator(), expected, "{method}");

            let negated = single(&Lambda::new("x", !body));
            assert_eq!(negated.operator(), expected.negate(), "!{method}");
        }
    }

    #[test]
    fn test_edge_records_agree_with_lambda() {
        let records = [
            Document::from_pairs([("Age", Value::Int(15)), ("Name", Value::Null)]),
            Document::from_pairs([("Age", Value::Int(25)), ("Name", Value::from("Al"))]),
        ];
        let cases = [
            (r#"x => x.Name.Equals(null)"#, "Name IS NULL"),
            (r#"x => !x.Age.StartsWith("1")"#, "Age NOT BEGIN LIKE '1'"),
            (r#"x => x.Age.Contains("5")"#, "Age LIKE '5'"),
        ];
        for (text, condition) in cases {
            let lambda = Lambda::parse(text).unwrap();
            let mut query = Query::new();
            query.and_expr(&lambda).unwrap();
            assert_eq!(query.to_string(), condition);
            for record in &records {
                assert_eq!(
                    query.predicate::<Document>().matches(record),
                    lambda.invoke(record),
                    "{text} on {record}"
                );
            }
        }
    }

    #[test]
    fn test_collection_contains() {
        let ids = Expr::list(vec![Expr::constant(1), Expr::constant(2)]);
        let instance = single(&Lambda::new("x", ids.clone().call("Contains", vec![x().member("Id")])));
        assert_eq!(instance.operator(), CriteriaOperator::In);
        assert_eq!(instance.value(), &Value::from(vec![1, 2]));

        let static_form = Expr::static_call("Contains", vec![ids, x().member("Id")]);
        let negated = single(&Lambda::new("x", !static_form));
        assert_eq!(negated.operator(), CriteriaOperator::NotIn);
    }

    #[test]
    fn test_bare_boolean_members() {
        let active = single(&Lambda::new("x", x().member("Active")));
        assert_eq!(active.operator(), CriteriaOperator::Equal);
        assert_eq!(active.value(), &Value::Bool(true));

        let inactive = single(&Lambda::new("x", !x().member("Active")));
        assert_eq!(inactive.operator(), CriteriaOperator::NotEqual);

        let double = single(&Lambda::new("x", !!x().member("Active")));
        assert_eq!(double.operator(), CriteriaOperator::Equal);
    }

    #[test]
    fn test_value_depending_on_parameter_is_malformed() {
        let lambda = Lambda::new(
            "x",
            x().member("Name")
                .call("StartsWith", vec![x().member("Prefix")]),
        );
        assert!(translate(&lambda).is_err());
    }

    #[test]
    fn test_unsupported_shapes_are_malformed() {
        for text in [
            "x => !(x.Age > 1 && x.Age < 5)",
            "x => x.Name.ToUpper()",
            "x => x.Profile.Age > 1",
            "x => x.Age + 1",
        ] {
            let lambda = Lambda::parse(text).unwrap();
            assert!(
                matches!(translate(&lambda), Err(QueryError::MalformedExpression(_))),
                "{text}"
            );
        }

        let foreign = Lambda::new("y", x().member("Age").greater_than(Expr::constant(1)));
        assert!(translate(&foreign).is_err());
    }

    #[test]
    fn test_computed_value_is_resolved_lazily() {
        let bindings = Bindings::from([("limit".to_string(), Value::Int(17))]);
        let lambda = Lambda::parse_with("x => x.Age > limit + 1", &bindings).unwrap();
        let criterion = single(&lambda);
        assert!(matches!(criterion.raw_value(), CriterionValue::Expression(_)));
        assert_eq!(criterion.value(), &Value::Int(18));
    }

    fn person_type() -> EntityType {
        EntityType::builder("Person")
            .primary_key("Id")
            .field(FieldInfo::new("Age").required())
            .field(FieldInfo::new("Name"))
            .build()
    }

    fn person_strategy() -> impl Strategy<Value = Document> {
        let age = prop_oneof![Just(18i64), Just(19i64), 0i64..100];
        let name = prop_oneof![
            Just(Some("A".to_string())),
            Just(Some("a".to_string())),
            Just(Some(String::new())),
            Just(None),
            "[A-Za-z]{0,5}".prop_map(Some),
        ];
        (0i64..1000, age, name).prop_map(|(id, age, name)| {
            Document::from_pairs([
                ("Id", Value::Int(id)),
                ("Age", Value::Int(age)),
                ("Name", Value::from(name)),
            ])
        })
    }

    const LAMBDAS: &[&str] = &[
        r#"x => x.Age > 18 && x.Name.StartsWith("A")"#,
        r#"x => x.Age >= 19 || x.Name == "a""#,
        r#"x => 18 < x.Age && !x.Name.EndsWith("a")"#,
        r#"x => x.Name != null && x.Name.Contains("A") || x.Age <= 18"#,
        r#"x => !(x.Name == "") && [18, 19, 20].Contains(x.Age)"#,
        r#"x => x.Name == null || !x.Name.Equals("A")"#,
        r#"x => x.Name.Equals(null) || x.Age.Contains("1")"#,
        r#"x => !x.Age.StartsWith("1") && !x.Name.EndsWith("a")"#,
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_translation_matches_lambda(
            people in prop::collection::vec(person_strategy(), 50..80)
        ) {
            for text in LAMBDAS {
                let lambda = Lambda::parse(text).unwrap();
                let mut query = Query::for_entity(person_type());
                query.and_expr(&lambda).unwrap();

                let expected: Vec<&Document> =
                    people.iter().filter(|p| lambda.invoke(*p)).collect();
                let actual = query.filter(&people);
                prop_assert_eq!(actual, expected, "{}", text);
            }
        }
    }
}
