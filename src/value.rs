use sqlx::Database;

use crate::error::{TrellisError, TrellisResult};
use crate::registry::{ColumnDefinition, ColumnType};

/// A positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Null,
}

impl BindValue {
    pub(crate) fn to_log_string(&self) -> String {
        match self {
            BindValue::String(v) => v.clone(),
            BindValue::I64(v) => v.to_string(),
            BindValue::F64(v) => v.to_string(),
            BindValue::Bool(v) => v.to_string(),
            BindValue::Uuid(v) => v.to_string(),
            BindValue::DateTime(v) => v.to_rfc3339(),
            BindValue::Null => "NULL".to_string(),
        }
    }
}

impl From<String> for BindValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i32> for BindValue {
    fn from(value: i32) -> Self {
        Self::I64(value as i64)
    }
}

impl From<i64> for BindValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<f64> for BindValue {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<bool> for BindValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<uuid::Uuid> for BindValue {
    fn from(value: uuid::Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for BindValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl<T> From<Option<T>> for BindValue
where
    T: Into<BindValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Converts a caller-supplied JSON value into a parameter for `column`,
/// checking it against the column's type tag.
pub(crate) fn bind_from_json(
    model: &str,
    column: &ColumnDefinition,
    value: &serde_json::Value,
) -> TrellisResult<BindValue> {
    use serde_json::Value;

    if value.is_null() {
        if !column.nullable {
            return Err(TrellisError::build(
                model,
                format!("column '{}' is not nullable", column.name),
            ));
        }
        return Ok(BindValue::Null);
    }

    let mismatch = || {
        TrellisError::build(
            model,
            format!(
                "column '{}' expects {:?}, got {}",
                column.name, column.ty, value
            ),
        )
    };

    match (column.ty, value) {
        (ColumnType::Integer, Value::Number(n)) => n.as_i64().map(BindValue::I64).ok_or_else(mismatch),
        (ColumnType::Float, Value::Number(n)) => n.as_f64().map(BindValue::F64).ok_or_else(mismatch),
        (ColumnType::Boolean, Value::Bool(b)) => Ok(BindValue::Bool(*b)),
        (ColumnType::Text, Value::String(s)) => Ok(BindValue::String(s.clone())),
        (ColumnType::Uuid, Value::String(s)) => uuid::Uuid::parse_str(s)
            .map(BindValue::Uuid)
            .map_err(|_| mismatch()),
        (ColumnType::DateTime, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|d| BindValue::DateTime(d.with_timezone(&chrono::Utc)))
            .map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

/// Binds one parameter onto a query, dispatching on the value's variant.
#[inline(always)]
pub(crate) fn bind_value_query<'q, DB>(
    query: sqlx::query::Query<'q, DB, <DB as Database>::Arguments<'q>>,
    value: BindValue,
) -> sqlx::query::Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    String: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    i64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    f64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    bool: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    uuid::Uuid: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    chrono::DateTime<chrono::Utc>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    Option<String>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    match value {
        BindValue::String(v) => query.bind(v),
        BindValue::I64(v) => query.bind(v),
        BindValue::F64(v) => query.bind(v),
        BindValue::Bool(v) => query.bind(v),
        BindValue::Uuid(v) => query.bind(v),
        BindValue::DateTime(v) => query.bind(v),
        BindValue::Null => query.bind(Option::<String>::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(name: &str, ty: ColumnType) -> ColumnDefinition {
        ColumnDefinition::new(name, ty)
    }

    #[test]
    fn converts_scalars_by_type_tag() {
        let b = bind_from_json("user", &col("id", ColumnType::Integer), &json!(7)).unwrap();
        assert_eq!(b, BindValue::I64(7));

        let b = bind_from_json("user", &col("score", ColumnType::Float), &json!(1.5)).unwrap();
        assert_eq!(b, BindValue::F64(1.5));

        let b = bind_from_json("user", &col("name", ColumnType::Text), &json!("a")).unwrap();
        assert_eq!(b, BindValue::String("a".to_string()));
    }

    #[test]
    fn rejects_type_mismatches() {
        let err = bind_from_json("user", &col("id", ColumnType::Integer), &json!("nope"));
        assert!(matches!(err, Err(TrellisError::Build { .. })));

        let err = bind_from_json("user", &col("ref", ColumnType::Uuid), &json!("not-a-uuid"));
        assert!(matches!(err, Err(TrellisError::Build { .. })));
    }

    #[test]
    fn null_requires_nullable_column() {
        let err = bind_from_json("user", &col("id", ColumnType::Integer), &json!(null));
        assert!(matches!(err, Err(TrellisError::Build { .. })));

        let ok = bind_from_json(
            "user",
            &col("bio", ColumnType::Text).nullable(),
            &json!(null),
        )
        .unwrap();
        assert_eq!(ok, BindValue::Null);
    }

    #[test]
    fn parses_temporal_and_uuid_strings() {
        let b = bind_from_json(
            "user",
            &col("ref", ColumnType::Uuid),
            &json!("67e55044-10b1-426f-9247-bb680e5fe0c8"),
        )
        .unwrap();
        assert!(matches!(b, BindValue::Uuid(_)));

        let b = bind_from_json(
            "user",
            &col("createdAt", ColumnType::DateTime),
            &json!("2024-05-01T10:00:00Z"),
        )
        .unwrap();
        assert!(matches!(b, BindValue::DateTime(_)));
    }
}
