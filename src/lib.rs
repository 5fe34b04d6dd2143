//! Composable query specifications.
//!
//! A [`Query`] is a criteria tree built through fluent calls or translated
//! from a predicate lambda. It can be serialized for an execution layer,
//! compiled into an in-memory [`predicate::Predicate`], or mined for fixed
//! key values.
//!
//! ```
//! use criteria_query::entity::Document;
//! use criteria_query::expr::Lambda;
//! use criteria_query::query::Query;
//! use criteria_query::value::Value;
//!
//! let lambda = Lambda::parse(r#"x => x.Age > 18 && x.Name.StartsWith("A")"#).unwrap();
//! let mut query = Query::new();
//! query.and_expr(&lambda).unwrap();
//!
//! let people = vec![
//!     Document::from_pairs([("Age", Value::Int(30)), ("Name", Value::from("Ann"))]),
//!     Document::from_pairs([("Age", Value::Int(12)), ("Name", Value::from("Al"))]),
//! ];
//! assert_eq!(query.filter(&people).len(), 1);
//! ```

pub mod attachment;
pub mod config;
pub mod criterion;
pub mod entity;
pub mod error;
pub mod expr;
pub mod lexer;
pub mod manager;
pub mod operator;
pub mod parser;
pub mod predicate;
pub mod query;
pub mod token;
pub mod translator;
pub mod value;

pub use error::{QueryError, Result};
pub use query::Query;
