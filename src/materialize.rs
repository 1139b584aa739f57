use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::Row;

use crate::dialect::SqlDialect;
use crate::error::TrellisResult;
use crate::planner::{ProjField, Projection};
use crate::registry::ColumnType;

/// Reassembles flat result rows into one nested object per top-level entity.
pub(crate) fn materialize_rows<DB>(
    rows: &[DB::Row],
    projection: &Projection,
) -> TrellisResult<Vec<Value>>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let refs: Vec<&DB::Row> = rows.iter().collect();
    materialize_many::<DB>(&refs, projection)
}

/// Materializes one returned row of a write into a flat object.
pub(crate) fn materialize_flat<DB>(row: &DB::Row, fields: &[ProjField]) -> TrellisResult<Value>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let mut map = Map::new();
    for field in fields {
        map.insert(
            field.name.clone(),
            decode_value::<DB>(row, &field.label, field.ty)?,
        );
    }
    Ok(Value::Object(map))
}

fn decode_value<DB>(row: &DB::Row, label: &str, ty: ColumnType) -> TrellisResult<Value>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let value = match ty {
        ColumnType::Integer => row.try_get::<Option<i64>, _>(label)?.map(Value::from),
        ColumnType::Float => row.try_get::<Option<f64>, _>(label)?.map(Value::from),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(label)?.map(Value::from),
        ColumnType::Text => row.try_get::<Option<String>, _>(label)?.map(Value::from),
        ColumnType::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(label)?
            .map(|v| Value::String(v.to_string())),
        ColumnType::DateTime => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(label)?
            .map(|v| Value::String(v.to_rfc3339())),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Returns a grouping key from the node's primary-key labels, or `None` when
/// every label is NULL (the join produced no row for this node).
fn entity_key<DB>(row: &DB::Row, pks: &[(String, ColumnType)]) -> TrellisResult<Option<String>>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let mut parts = Vec::with_capacity(pks.len());
    let mut all_null = true;
    for (label, ty) in pks {
        let value = decode_value::<DB>(row, label, *ty)?;
        if !value.is_null() {
            all_null = false;
        }
        parts.push(value.to_string());
    }
    Ok(if all_null {
        None
    } else {
        Some(parts.join("\u{1f}"))
    })
}

/// Groups rows by the node's primary key in first-seen order and builds one
/// object per entity. Lateral joins repeat parent values once per child row
/// and sibling laterals cross-multiply, so grouping also deduplicates.
fn materialize_many<DB>(rows: &[&DB::Row], projection: &Projection) -> TrellisResult<Vec<Value>>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let mut key_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&DB::Row>> = HashMap::new();
    for &row in rows {
        if let Some(key) = entity_key::<DB>(row, &projection.pks)? {
            if !groups.contains_key(&key) {
                key_order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }
    }

    key_order
        .iter()
        .map(|key| build_object::<DB>(&groups[key], projection))
        .collect()
}

fn build_object<DB>(rows: &[&DB::Row], projection: &Projection) -> TrellisResult<Value>
where
    DB: SqlDialect,
    for<'c> &'c str: sqlx::ColumnIndex<DB::Row>,
    i64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    f64: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    bool: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    uuid::Uuid: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    let first = rows[0];
    let mut map = Map::new();
    for field in &projection.fields {
        if !field.requested {
            continue;
        }
        map.insert(
            field.name.clone(),
            decode_value::<DB>(first, &field.label, field.ty)?,
        );
    }

    for (name, many, child) in &projection.nested {
        if *many {
            map.insert(
                name.clone(),
                Value::Array(materialize_many::<DB>(rows, child)?),
            );
        } else {
            // A null to-one join is an absent object, not an object of nulls.
            let value = match entity_key::<DB>(first, &child.pks)? {
                Some(_) => build_object::<DB>(rows, child)?,
                None => Value::Null,
            };
            map.insert(name.clone(), value);
        }
    }
    Ok(Value::Object(map))
}
