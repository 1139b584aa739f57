use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::dialect::SqlDialect;
use crate::error::{TrellisError, TrellisResult};
use crate::planner::ProjField;
use crate::predicate::Predicate;
use crate::registry::{ColumnDefault, ColumnDefinition, ModelDefinition, Registry};
use crate::sql::SqlBuf;
use crate::value::{bind_from_json, BindValue};

/// What to do when an insert hits a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Let the constraint violation surface as an error.
    Error,
    /// Suppress the violation by affecting zero rows instead.
    DoNothing,
}

/// A create request: one or many rows, a conflict policy and an optional
/// returning list.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub rows: Vec<Value>,
    pub on_conflict: OnConflict,
    pub returning: Vec<String>,
}

impl CreateSpec {
    pub fn row(row: Value) -> Self {
        Self::rows(vec![row])
    }

    pub fn rows(rows: Vec<Value>) -> Self {
        Self {
            rows,
            on_conflict: OnConflict::Error,
            returning: Vec::new(),
        }
    }

    pub fn on_conflict_do_nothing(mut self) -> Self {
        self.on_conflict = OnConflict::DoNothing;
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// An update request. The predicate is required: a leaf-free predicate is
/// rejected at build time as a guard against accidental full-table mutation.
#[derive(Debug, Clone)]
pub struct UpdateSpec {
    pub predicate: Predicate,
    pub values: Value,
    pub returning: Vec<String>,
}

impl UpdateSpec {
    pub fn new(predicate: Predicate, values: Value) -> Self {
        Self {
            predicate,
            values,
            returning: Vec::new(),
        }
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// A delete request. Same predicate guard as [`UpdateSpec`].
#[derive(Debug, Clone)]
pub struct DeleteSpec {
    pub predicate: Predicate,
    pub returning: Vec<String>,
}

impl DeleteSpec {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            returning: Vec::new(),
        }
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// A compiled write statement plus the shape of its RETURNING rows.
pub(crate) struct CompiledWrite {
    pub sql: String,
    pub params: SmallVec<[BindValue; 8]>,
    pub returning: Vec<ProjField>,
}

/// Turns a caller-supplied row value into a map, rejecting non-objects.
pub(crate) fn row_object(model: &str, value: &Value) -> TrellisResult<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| TrellisError::build(model, "row values must be a JSON object"))
}

fn returning_fields(
    model: &ModelDefinition,
    returning: &[String],
) -> TrellisResult<Vec<ProjField>> {
    returning
        .iter()
        .map(|name| {
            let column = model.column_by_name(name).ok_or_else(|| {
                TrellisError::build(
                    &model.name,
                    format!("unknown column '{}' in returning", name),
                )
            })?;
            Ok(ProjField {
                label: column.name.clone(),
                name: column.name.clone(),
                ty: column.ty,
                requested: true,
            })
        })
        .collect()
}

fn push_returning<DB: SqlDialect>(
    model: &ModelDefinition,
    returning: &[ProjField],
    buf: &mut SqlBuf,
) -> TrellisResult<()> {
    if returning.is_empty() {
        return Ok(());
    }
    if !DB::supports_returning() {
        return Err(TrellisError::build(
            &model.name,
            "this database does not support RETURNING",
        ));
    }
    buf.push(" RETURNING ");
    for (i, field) in returning.iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        let column = model
            .column_by_name(&field.name)
            .expect("returning fields are pre-validated");
        buf.push(&format!(
            "{} AS {}",
            DB::quote_identifier(&column.stored),
            DB::quote_identifier(&field.name)
        ));
    }
    Ok(())
}

fn table_sql<DB: SqlDialect>(model: &ModelDefinition) -> String {
    match &model.schema {
        Some(schema) => format!(
            "{}.{}",
            DB::quote_identifier(schema),
            DB::quote_identifier(&model.table)
        ),
        None => DB::quote_identifier(&model.table),
    }
}

/// Columns a create row must supply: non-nullable, no default, and not part
/// of the primary key (primary keys may be database-generated).
fn required_columns(model: &ModelDefinition) -> impl Iterator<Item = &ColumnDefinition> {
    model
        .columns
        .iter()
        .filter(|c| !c.nullable && c.default.is_none() && !c.primary_key)
}

/// Compiles a multi-row INSERT. The column list is the union of keys across
/// all rows in first-seen order; rows missing a column fall back to the
/// registry default or the dialect's missing-value literal.
pub(crate) fn compile_create<DB: SqlDialect>(
    registry: &Registry,
    model_name: &str,
    rows: &[Map<String, Value>],
    on_conflict: OnConflict,
    returning: &[String],
) -> TrellisResult<CompiledWrite> {
    let model = registry.model(model_name)?;
    if rows.is_empty() {
        return Err(TrellisError::build(model_name, "no rows to insert"));
    }

    let mut columns: Vec<&ColumnDefinition> = Vec::new();
    for row in rows {
        for key in row.keys() {
            let column = model.column_by_name(key).ok_or_else(|| {
                TrellisError::build(model_name, format!("unknown column '{}'", key))
            })?;
            if !columns.iter().any(|c| c.name == column.name) {
                columns.push(column);
            }
        }
    }
    if columns.is_empty() {
        return Err(TrellisError::build(model_name, "rows carry no columns"));
    }

    for (i, row) in rows.iter().enumerate() {
        for column in required_columns(model) {
            if !row.contains_key(&column.name) {
                return Err(TrellisError::build(
                    model_name,
                    format!("row {} is missing required column '{}'", i, column.name),
                ));
            }
        }
    }

    let returning = returning_fields(model, returning)?;
    let mut buf = SqlBuf::new();
    buf.push("INSERT INTO ");
    buf.push(&table_sql::<DB>(model));
    buf.push(" (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.push(&DB::quote_identifier(&column.stored));
    }
    buf.push(") VALUES ");

    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.push("(");
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                buf.push(", ");
            }
            match row.get(&column.name) {
                Some(value) => {
                    let bind = bind_from_json(model_name, column, value)?;
                    buf.push_param::<DB>(bind);
                }
                None => match &column.default {
                    Some(ColumnDefault::Value(value)) => buf.push_param::<DB>(value.clone()),
                    Some(ColumnDefault::Expression(expr)) => buf.push(expr),
                    None => buf.push(DB::missing_insert_value()),
                },
            }
        }
        buf.push(")");
    }

    if on_conflict == OnConflict::DoNothing {
        buf.push(" ON CONFLICT DO NOTHING");
    }
    push_returning::<DB>(model, &returning, &mut buf)?;

    Ok(CompiledWrite {
        sql: buf.sql,
        params: buf.params,
        returning,
    })
}

/// Compiles an UPDATE with a mandatory non-empty predicate and change-set.
pub(crate) fn compile_update<DB: SqlDialect>(
    registry: &Registry,
    model_name: &str,
    predicate: &Predicate,
    values: &Map<String, Value>,
    returning: &[String],
) -> TrellisResult<CompiledWrite> {
    let model = registry.model(model_name)?;
    if predicate.is_empty() {
        return Err(TrellisError::build(
            model_name,
            "update requires a non-empty predicate",
        ));
    }
    if values.is_empty() {
        return Err(TrellisError::build(
            model_name,
            "update requires a non-empty change-set",
        ));
    }

    let returning = returning_fields(model, returning)?;
    let mut buf = SqlBuf::new();
    buf.push("UPDATE ");
    buf.push(&table_sql::<DB>(model));
    buf.push(" SET ");
    for (i, (key, value)) in values.iter().enumerate() {
        let column = model
            .column_by_name(key)
            .ok_or_else(|| TrellisError::build(model_name, format!("unknown column '{}'", key)))?;
        if i > 0 {
            buf.push(", ");
        }
        buf.push(&DB::quote_identifier(&column.stored));
        buf.push(" = ");
        buf.push_param::<DB>(bind_from_json(model_name, column, value)?);
    }

    buf.push(" WHERE ");
    predicate.compile::<DB>(model, None, &mut buf)?;
    push_returning::<DB>(model, &returning, &mut buf)?;

    Ok(CompiledWrite {
        sql: buf.sql,
        params: buf.params,
        returning,
    })
}

/// Compiles a DELETE with a mandatory non-empty predicate.
pub(crate) fn compile_delete<DB: SqlDialect>(
    registry: &Registry,
    model_name: &str,
    predicate: &Predicate,
    returning: &[String],
) -> TrellisResult<CompiledWrite> {
    let model = registry.model(model_name)?;
    if predicate.is_empty() {
        return Err(TrellisError::build(
            model_name,
            "delete requires a non-empty predicate",
        ));
    }

    let returning = returning_fields(model, returning)?;
    let mut buf = SqlBuf::new();
    buf.push("DELETE FROM ");
    buf.push(&table_sql::<DB>(model));
    buf.push(" WHERE ");
    predicate.compile::<DB>(model, None, &mut buf)?;
    push_returning::<DB>(model, &returning, &mut buf)?;

    Ok(CompiledWrite {
        sql: buf.sql,
        params: buf.params,
        returning,
    })
}
