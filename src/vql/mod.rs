//! Vantage Query Language: a small SELECT-only SQL-like surface over
//! `metrics`, `traces`, `spans` and `alerts`, parsed with regexes rather
//! than a full grammar and translated to parameterized SQLite, the way
//! `vantage-api/api/vql.py` does it. [`security`] applies the whitelists
//! that make this safe to expose to untrusted clients before [`executor`]
//! ever sees the query.

mod executor;
mod parser;
mod security;

pub use executor::{execute, VqlResult};
pub use parser::{parse, OrderDirection, VqlQuery, WhereCondition};
pub use security::validate_query_text;
