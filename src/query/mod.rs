//! Restricted SQL query operator
//!
//! Supports `SELECT <cols|*|aggregates> FROM <table> [WHERE col op val]
//! [ORDER BY col [ASC|DESC]] [LIMIT n]` evaluated over a decrypted
//! in-memory record batch. Anything outside the subset is a parse error.

pub mod executor;
pub mod parser;

pub use executor::execute;
pub use parser::{
    parse, AggregateFunc, CompareOp, OrderByClause, SelectItem, SelectStatement, WhereClause,
};
