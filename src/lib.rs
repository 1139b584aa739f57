//! # Trellis
//!
//! > **"Describe the shape, get one statement."**
//!
//! Trellis is a declarative relational access layer. Callers describe nested
//! reads and writes over a registry of named models and relations; Trellis
//! compiles each call into a single parameterized SQL statement, executes it
//! through a pooled `sqlx` connection inside correct transactional
//! boundaries, and reassembles the flat result rows into nested
//! [`serde_json`] objects matching the query's shape.
//!
//! ## Key pieces
//!
//! - **Registry**: immutable model/column/relation metadata, built once.
//! - **Planner**: to-one relations become plain joins; to-many relations
//!   become independently paginated lateral subqueries.
//! - **Hooks**: predicate and values rewriters, re-applied at every relation
//!   depth, so cross-cutting filters compose with arbitrary nesting.
//! - **Transactions**: nested `transact` calls reuse the open connection
//!   through uniquely named savepoints.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trellis::prelude::*;
//! use serde_json::json;
//!
//! # async fn example() -> trellis::TrellisResult<()> {
//! let registry = Registry::new(vec![
//!     ModelDefinition::new("user")
//!         .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
//!         .column(ColumnDefinition::new("username", ColumnType::Text))
//!         .relation("posts", RelationDefinition::to_many("post", ["user_id"])),
//!     ModelDefinition::new("post")
//!         .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
//!         .column(ColumnDefinition::new("user_id", ColumnType::Integer))
//!         .column(ColumnDefinition::new("title", ColumnType::Text)),
//! ])?;
//!
//! let pool = trellis::sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
//! let db = Db::new(pool, registry);
//!
//! db.create_many("user", CreateSpec::row(json!({ "username": "alice" }))).await?;
//! let users = db
//!     .find_many(
//!         "user",
//!         FindSpec::new()
//!             .filter(Predicate::like("username", "a%"))
//!             .include("posts", FindSpec::new().limit(10)),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use sqlx;

mod materialize;
mod planner;
mod sql;

pub mod db;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod hooks;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod value;
pub mod write;

pub use db::{Db, TransactOptions, TxSession, WriteResult};
pub use dialect::SqlDialect;
pub use error::{TrellisError, TrellisResult};
pub use executor::Executor;
pub use hooks::{HookScope, Hooks, PredicateHook, ValuesHook};
pub use predicate::{CompareOp, PredValue, Predicate};
pub use query::{Direction, FindSpec, OrderBy, RowLock};
pub use registry::{
    ColumnDefault, ColumnDefinition, ColumnType, ModelDefinition, Registry, RelationDefinition,
};
pub use value::BindValue;
pub use write::{CreateSpec, DeleteSpec, OnConflict, UpdateSpec};

pub mod prelude {
    pub use crate::db::{Db, TransactOptions, TxSession, WriteResult};
    pub use crate::error::{TrellisError, TrellisResult};
    pub use crate::hooks::{HookScope, Hooks};
    pub use crate::predicate::Predicate;
    pub use crate::query::{Direction, FindSpec, RowLock};
    pub use crate::registry::{
        ColumnDefinition, ColumnType, ModelDefinition, Registry, RelationDefinition,
    };
    pub use crate::write::{CreateSpec, DeleteSpec, OnConflict, UpdateSpec};
}
