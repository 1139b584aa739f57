use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::Database;

use crate::dialect::SqlDialect;
use crate::error::{TrellisError, TrellisResult};
use crate::executor::Executor;
use crate::hooks::Hooks;
use crate::materialize::{materialize_flat, materialize_rows};
use crate::planner::{compile_count, compile_find, compile_find_one};
use crate::query::FindSpec;
use crate::registry::Registry;
use crate::value::bind_value_query;
use crate::write::{
    compile_create, compile_delete, compile_update, row_object, CreateSpec, DeleteSpec, UpdateSpec,
};

#[cfg(feature = "metrics")]
fn record_query_metrics(operation: &'static str, model: &str, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [
        ("operation", operation.to_string()),
        ("model", model.to_string()),
    ];
    metrics::histogram!("trellis.query.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("trellis.query.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn record_query_metrics(_operation: &'static str, _model: &str, _elapsed: Duration) {}

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

fn savepoint_name(depth: u32) -> String {
    let seq = SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("trellis_sp_{}_{}", depth, seq)
}

/// Options for [`Db::transact_with`] / [`TxSession::transact_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactOptions {
    /// Roll the work back on success instead of committing/releasing it.
    /// Gives isolation without persisting anything.
    pub rollback: bool,
}

/// The outcome of a many-row write.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Rows the statement affected.
    pub affected: u64,
    /// Materialized RETURNING rows, empty unless requested.
    pub returned: Vec<Value>,
}

fn single_row(model: &str, operation: &'static str, result: WriteResult) -> TrellisResult<Value> {
    let WriteResult {
        affected,
        mut returned,
    } = result;
    match affected {
        1 => returned.pop().ok_or_else(|| {
            TrellisError::build(model, "single-row write returned no row")
        }),
        0 => Err(TrellisError::ZeroRowsAffected {
            model: model.to_string(),
            operation,
        }),
        _ => Err(TrellisError::MultipleRowsAffected {
            model: model.to_string(),
            operation,
            affected,
        }),
    }
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_find_many<DB>(
    registry: &Registry,
    hooks: &Hooks,
    mut exec: Executor<'_, DB>,
    model: &str,
    spec: &FindSpec,
) -> TrellisResult<Vec<Value>>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    let compiled = compile_find::<DB>(registry, hooks, model, spec)?;

    #[cfg(debug_assertions)]
    tracing::debug!(
        operation = "find_many",
        model = %model,
        sql = %compiled.sql,
        filters = %format_filters(registry, model, spec),
        "trellis query"
    );

    let start = Instant::now();
    let mut query = sqlx::query::<DB>(&compiled.sql);
    for param in compiled.params {
        query = bind_value_query(query, param);
    }
    let rows = exec.fetch_rows(query).await?;
    record_query_metrics("find_many", model, start.elapsed());

    materialize_rows::<DB>(&rows, &compiled.projection)
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_find_one<DB>(
    registry: &Registry,
    hooks: &Hooks,
    mut exec: Executor<'_, DB>,
    model: &str,
    spec: &FindSpec,
) -> TrellisResult<Value>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    let compiled = compile_find_one::<DB>(registry, hooks, model, spec)?;

    #[cfg(debug_assertions)]
    tracing::debug!(
        operation = "find_one",
        model = %model,
        sql = %compiled.sql,
        filters = %format_filters(registry, model, spec),
        "trellis query"
    );

    let start = Instant::now();
    let mut query = sqlx::query::<DB>(&compiled.sql);
    for param in compiled.params {
        query = bind_value_query(query, param);
    }
    let rows = exec.fetch_rows(query).await?;
    record_query_metrics("find_one", model, start.elapsed());

    let mut objects = materialize_rows::<DB>(&rows, &compiled.projection)?;
    match objects.len() {
        1 => Ok(objects.remove(0)),
        0 => Err(TrellisError::NotFound {
            model: model.to_string(),
        }),
        _ => Err(TrellisError::NotUnique {
            model: model.to_string(),
        }),
    }
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_count<DB>(
    registry: &Registry,
    hooks: &Hooks,
    mut exec: Executor<'_, DB>,
    model: &str,
    spec: &FindSpec,
) -> TrellisResult<u64>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    use sqlx::Row;

    let compiled = compile_count::<DB>(registry, hooks, model, spec)?;

    #[cfg(debug_assertions)]
    tracing::debug!(
        operation = "count",
        model = %model,
        sql = %compiled.sql,
        "trellis query"
    );

    let start = Instant::now();
    let mut query = sqlx::query::<DB>(&compiled.sql);
    for param in compiled.params {
        query = bind_value_query(query, param);
    }
    let rows = exec.fetch_rows(query).await?;
    record_query_metrics("count", model, start.elapsed());

    let row = rows.first().ok_or(sqlx::Error::RowNotFound)?;
    let count: i64 = row.try_get("count")?;
    Ok(count as u64)
}

async fn run_write<DB>(
    mut exec: Executor<'_, DB>,
    operation: &'static str,
    model: &str,
    sql: &str,
    params: smallvec::SmallVec<[crate::value::BindValue; 8]>,
    returning: &[crate::planner::ProjField],
) -> TrellisResult<WriteResult>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    tracing::debug!(
        operation = %operation,
        model = %model,
        sql = %sql,
        "trellis write"
    );

    let start = Instant::now();
    let mut query = sqlx::query::<DB>(sql);
    for param in params {
        query = bind_value_query(query, param);
    }

    let result = if returning.is_empty() {
        let outcome = exec.execute(query).await?;
        WriteResult {
            affected: DB::rows_affected(&outcome),
            returned: Vec::new(),
        }
    } else {
        let rows = exec.fetch_rows(query).await?;
        let returned = rows
            .iter()
            .map(|row| materialize_flat::<DB>(row, returning))
            .collect::<TrellisResult<Vec<_>>>()?;
        WriteResult {
            affected: returned.len() as u64,
            returned,
        }
    };
    record_query_metrics(operation, model, start.elapsed());
    Ok(result)
}

#[cfg(debug_assertions)]
fn format_filters(registry: &Registry, model: &str, spec: &FindSpec) -> String {
    match (registry.model(model), &spec.predicate) {
        (Ok(definition), Some(predicate)) => predicate.format_for_log(definition),
        _ => String::new(),
    }
}

/// The client handle: a pool, the registry and the middleware pipeline.
///
/// Cheap to clone; clones share the pool and metadata.
pub struct Db<DB: Database> {
    pool: sqlx::Pool<DB>,
    registry: Arc<Registry>,
    hooks: Arc<Hooks>,
}

impl<DB: Database> Clone for Db<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

impl<DB: Database> std::fmt::Debug for Db<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl<DB: Database> Db<DB> {
    pub fn new(pool: sqlx::Pool<DB>, registry: Registry) -> Self {
        Self {
            pool,
            registry: Arc::new(registry),
            hooks: Arc::new(Hooks::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &sqlx::Pool<DB> {
        &self.pool
    }
}

impl<DB> Db<DB>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    /// Finds every row matching the spec, reassembled into nested objects.
    pub async fn find_many(&self, model: &str, spec: FindSpec) -> TrellisResult<Vec<Value>> {
        run_find_many(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    /// Finds exactly one row; zero rows and two-or-more rows raise distinct
    /// errors.
    pub async fn find_one(&self, model: &str, spec: FindSpec) -> TrellisResult<Value> {
        run_find_one(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    /// Counts matching rows. Ordering, pagination and includes are ignored.
    pub async fn count(&self, model: &str, spec: FindSpec) -> TrellisResult<u64> {
        run_count(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    pub async fn create_many(&self, model: &str, spec: CreateSpec) -> TrellisResult<WriteResult> {
        run_create(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    pub async fn update_many(&self, model: &str, spec: UpdateSpec) -> TrellisResult<WriteResult> {
        run_update(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    pub async fn delete_many(&self, model: &str, spec: DeleteSpec) -> TrellisResult<WriteResult> {
        run_delete(
            &self.registry,
            &self.hooks,
            Executor::Pool(&self.pool),
            model,
            &spec,
        )
        .await
    }

    /// Creates exactly one row and returns it. Runs inside its own
    /// transaction so a violated invariant leaves the store unchanged.
    pub async fn create_one(&self, model: &str, spec: CreateSpec) -> TrellisResult<Value> {
        let model_name = model.to_string();
        self.transact(move |tx| Box::pin(async move { tx.create_one(&model_name, spec).await }))
            .await
    }

    /// Updates exactly one row and returns it; zero or multiple matches roll
    /// back and raise.
    pub async fn update_one(&self, model: &str, spec: UpdateSpec) -> TrellisResult<Value> {
        let model_name = model.to_string();
        self.transact(move |tx| Box::pin(async move { tx.update_one(&model_name, spec).await }))
            .await
    }

    /// Deletes exactly one row and returns it; zero or multiple matches roll
    /// back and raise.
    pub async fn delete_one(&self, model: &str, spec: DeleteSpec) -> TrellisResult<Value> {
        let model_name = model.to_string();
        self.transact(move |tx| Box::pin(async move { tx.delete_one(&model_name, spec).await }))
            .await
    }

    /// Runs `f` inside a transaction: commits on success, rolls back on
    /// failure, and always returns the pooled connection.
    pub async fn transact<T, F>(&self, f: F) -> TrellisResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TxSession<DB>) -> BoxFuture<'t, TrellisResult<T>> + Send,
    {
        self.transact_with(TransactOptions::default(), f).await
    }

    /// Like [`transact`](Self::transact), with options. `rollback: true`
    /// rolls back even on success (the test-transaction pattern).
    pub async fn transact_with<T, F>(&self, options: TransactOptions, f: F) -> TrellisResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TxSession<DB>) -> BoxFuture<'t, TrellisResult<T>> + Send,
    {
        let conn = self.pool.acquire().await?;
        let mut session = TxSession {
            conn,
            depth: 0,
            registry: self.registry.clone(),
            hooks: self.hooks.clone(),
        };
        session.execute_raw("BEGIN").await?;
        match f(&mut session).await {
            Ok(value) => {
                if options.rollback {
                    session.execute_raw("ROLLBACK").await?;
                } else {
                    session.execute_raw("COMMIT").await?;
                }
                Ok(value)
            }
            Err(err) => {
                // Surface the original failure even if the rollback also fails.
                let _ = session.execute_raw("ROLLBACK").await;
                Err(err)
            }
        }
        // The pooled connection returns to the pool when `session` drops.
    }
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_create<DB>(
    registry: &Registry,
    hooks: &Hooks,
    exec: Executor<'_, DB>,
    model: &str,
    spec: &CreateSpec,
) -> TrellisResult<WriteResult>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    // Values middleware runs per row, before the required-column check.
    let rows = spec
        .rows
        .iter()
        .map(|row| {
            let object = row_object(model, row)?;
            Ok(hooks.apply_create_values(registry, model, object))
        })
        .collect::<TrellisResult<Vec<_>>>()?;

    let compiled =
        compile_create::<DB>(registry, model, &rows, spec.on_conflict, &spec.returning)?;
    run_write(
        exec,
        "create_many",
        model,
        &compiled.sql,
        compiled.params,
        &compiled.returning,
    )
    .await
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_update<DB>(
    registry: &Registry,
    hooks: &Hooks,
    exec: Executor<'_, DB>,
    model: &str,
    spec: &UpdateSpec,
) -> TrellisResult<WriteResult>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    if spec.predicate.is_empty() {
        return Err(TrellisError::build(
            model,
            "update requires a non-empty predicate",
        ));
    }
    let values = row_object(model, &spec.values)?;
    if values.is_empty() {
        return Err(TrellisError::build(
            model,
            "update requires a non-empty change-set",
        ));
    }

    let values = hooks.apply_update_values(registry, model, values);
    let predicate = hooks
        .apply_update_predicate(registry, model, Some(spec.predicate.clone()))
        .unwrap_or_else(|| crate::predicate::Predicate::And(Vec::new()));

    let compiled =
        compile_update::<DB>(registry, model, &predicate, &values, &spec.returning)?;
    run_write(
        exec,
        "update_many",
        model,
        &compiled.sql,
        compiled.params,
        &compiled.returning,
    )
    .await
}

#[tracing::instrument(skip_all, fields(model = %model))]
async fn run_delete<DB>(
    registry: &Registry,
    hooks: &Hooks,
    exec: Executor<'_, DB>,
    model: &str,
    spec: &DeleteSpec,
) -> TrellisResult<WriteResult>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    if spec.predicate.is_empty() {
        return Err(TrellisError::build(
            model,
            "delete requires a non-empty predicate",
        ));
    }
    let predicate = hooks
        .apply_delete_predicate(registry, model, Some(spec.predicate.clone()))
        .unwrap_or_else(|| crate::predicate::Predicate::And(Vec::new()));

    let compiled = compile_delete::<DB>(registry, model, &predicate, &spec.returning)?;
    run_write(
        exec,
        "delete_many",
        model,
        &compiled.sql,
        compiled.params,
        &compiled.returning,
    )
    .await
}

/// A transaction in progress: a dedicated connection plus savepoint depth.
///
/// Obtained through [`Db::transact`]; exposes the same operation set as
/// [`Db`], executed inside the transaction. Nested [`transact`] calls reuse
/// the connection through uniquely named savepoints rather than acquiring a
/// second one.
///
/// [`transact`]: Self::transact
pub struct TxSession<DB: Database> {
    conn: PoolConnection<DB>,
    depth: u32,
    registry: Arc<Registry>,
    hooks: Arc<Hooks>,
}

impl<DB: Database> std::fmt::Debug for TxSession<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSession")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl<DB> TxSession<DB>
where
    DB: SqlDialect,
    DB::Connection: Send,
    for<'q> <DB as Database>::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    String: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    i64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>:
        for<'q> sqlx::Encode<'q, DB> + for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    Option<String>: for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    async fn execute_raw(&mut self, sql: &str) -> TrellisResult<()> {
        sqlx::query::<DB>(sql).execute(&mut *self.conn).await?;
        Ok(())
    }

    /// How many savepoints are currently stacked on this transaction.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn find_many(&mut self, model: &str, spec: FindSpec) -> TrellisResult<Vec<Value>> {
        run_find_many(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    pub async fn find_one(&mut self, model: &str, spec: FindSpec) -> TrellisResult<Value> {
        run_find_one(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    pub async fn count(&mut self, model: &str, spec: FindSpec) -> TrellisResult<u64> {
        run_count(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    pub async fn create_many(
        &mut self,
        model: &str,
        spec: CreateSpec,
    ) -> TrellisResult<WriteResult> {
        run_create(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    pub async fn update_many(
        &mut self,
        model: &str,
        spec: UpdateSpec,
    ) -> TrellisResult<WriteResult> {
        run_update(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    pub async fn delete_many(
        &mut self,
        model: &str,
        spec: DeleteSpec,
    ) -> TrellisResult<WriteResult> {
        run_delete(
            &self.registry.clone(),
            &self.hooks.clone(),
            Executor::Conn(&mut *self.conn),
            model,
            &spec,
        )
        .await
    }

    /// Creates exactly one row inside a nested savepoint; a conflict-suppressed
    /// insert (zero rows) rolls the savepoint back and raises.
    pub async fn create_one(&mut self, model: &str, spec: CreateSpec) -> TrellisResult<Value> {
        if spec.rows.len() != 1 {
            return Err(TrellisError::build(
                model,
                "create_one requires exactly one row",
            ));
        }
        let model_name = model.to_string();
        let spec = self.force_returning(model, spec.returning.clone(), |returning| CreateSpec {
            returning,
            ..spec.clone()
        })?;
        self.transact(move |tx| {
            Box::pin(async move {
                let result = tx.create_many(&model_name, spec).await?;
                single_row(&model_name, "create_one", result)
            })
        })
        .await
    }

    /// Updates exactly one row inside a nested savepoint; zero or multiple
    /// affected rows roll back to the pre-call savepoint and raise.
    pub async fn update_one(&mut self, model: &str, spec: UpdateSpec) -> TrellisResult<Value> {
        let model_name = model.to_string();
        let spec = self.force_returning(model, spec.returning.clone(), |returning| UpdateSpec {
            returning,
            ..spec.clone()
        })?;
        self.transact(move |tx| {
            Box::pin(async move {
                let result = tx.update_many(&model_name, spec).await?;
                single_row(&model_name, "update_one", result)
            })
        })
        .await
    }

    /// Deletes exactly one row inside a nested savepoint; zero or multiple
    /// affected rows roll back to the pre-call savepoint and raise.
    pub async fn delete_one(&mut self, model: &str, spec: DeleteSpec) -> TrellisResult<Value> {
        let model_name = model.to_string();
        let spec = self.force_returning(model, spec.returning.clone(), |returning| DeleteSpec {
            returning,
            ..spec.clone()
        })?;
        self.transact(move |tx| {
            Box::pin(async move {
                let result = tx.delete_many(&model_name, spec).await?;
                single_row(&model_name, "delete_one", result)
            })
        })
        .await
    }

    fn force_returning<S>(
        &self,
        model: &str,
        returning: Vec<String>,
        rebuild: impl FnOnce(Vec<String>) -> S,
    ) -> TrellisResult<S> {
        let returning = if returning.is_empty() {
            self.registry
                .model(model)?
                .columns
                .iter()
                .map(|c| c.name.clone())
                .collect()
        } else {
            returning
        };
        Ok(rebuild(returning))
    }

    /// Runs `f` under a nested savepoint: released on success, rolled back to
    /// on failure (or on success when `rollback` is requested).
    pub async fn transact<T, F>(&mut self, f: F) -> TrellisResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TxSession<DB>) -> BoxFuture<'t, TrellisResult<T>> + Send,
    {
        self.transact_with(TransactOptions::default(), f).await
    }

    /// Like [`transact`](Self::transact), with options.
    pub async fn transact_with<T, F>(
        &mut self,
        options: TransactOptions,
        f: F,
    ) -> TrellisResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TxSession<DB>) -> BoxFuture<'t, TrellisResult<T>> + Send,
    {
        let name = savepoint_name(self.depth);
        self.execute_raw(&format!("SAVEPOINT {}", name)).await?;
        self.depth += 1;
        let outcome = f(self).await;
        self.depth -= 1;
        match outcome {
            Ok(value) => {
                if options.rollback {
                    self.execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", name))
                        .await?;
                }
                self.execute_raw(&format!("RELEASE SAVEPOINT {}", name)).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = self
                    .execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", name))
                    .await;
                let _ = self.execute_raw(&format!("RELEASE SAVEPOINT {}", name)).await;
                Err(err)
            }
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::registry::{ColumnDefinition, ColumnType, ModelDefinition};
    use sqlx::Sqlite;

    fn registry() -> Registry {
        Registry::new(vec![
            ModelDefinition::new("user")
                .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
                .column(ColumnDefinition::new("username", ColumnType::Text)),
        ])
        .unwrap()
    }

    fn assert_send<F: Send>(f: F) -> F {
        f
    }

    #[tokio::test]
    async fn public_futures_are_send() {
        let pool = sqlx::Pool::<Sqlite>::connect_lazy("sqlite::memory:").unwrap();
        let db = Db::new(pool, registry());

        let find = assert_send(db.find_many("user", FindSpec::new()));
        drop(find);

        let tx = assert_send(db.transact(|tx| {
            Box::pin(async move { tx.count("user", FindSpec::new()).await })
        }));
        drop(tx);
    }

    #[test]
    fn savepoint_names_are_unique() {
        let a = savepoint_name(0);
        let b = savepoint_name(0);
        assert_ne!(a, b);
    }
}
