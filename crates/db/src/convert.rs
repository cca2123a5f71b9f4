//! Conversion between script-level values and PostgreSQL wire values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use pglua_core::transaction::{DbError, FieldValue, SqlParam};
use sqlx::postgres::{PgArguments, PgRow, PgValueFormat, PgValueRef};
use sqlx::types::Decimal;
use sqlx::query::Query;
use sqlx::{Postgres, Row, TypeInfo, ValueRef};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Bind positional parameters in order.
///
/// `SqlParam::Null` is bound as a text-typed NULL; statements comparing it
/// against other column types need an explicit cast (`$1::int`).
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(b) => query.bind(*b),
            SqlParam::Int(i) => query.bind(*i),
            SqlParam::Float(f) => query.bind(*f),
            SqlParam::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Split driver errors into statement failures, which scripts may recover
/// from, and connection failures.
pub fn db_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(e) => DbError::Statement(e.to_string()),
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_)
        | sqlx::Error::RowNotFound) => DbError::Statement(e.to_string()),
        other => DbError::Connection(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

pub fn row_values(row: &PgRow) -> Vec<FieldValue> {
    (0..row.len()).map(|index| field_value(row, index)).collect()
}

/// Convert one column of `row`.
///
/// Timestamps, dates, UUIDs and NUMERIC are rendered as text. Types without
/// a dedicated conversion log a warning and fall back to their text form
/// when the server sent one, or to null for binary-encoded values.
pub fn field_value(row: &PgRow, index: usize) -> FieldValue {
    let raw = match row.try_get_raw(index) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(index, error = %e, "Failed to read column");
            return FieldValue::Null;
        }
    };
    if raw.is_null() {
        return FieldValue::Null;
    }
    let type_name = raw.type_info().name().to_string();

    let converted = match type_name.as_str() {
        "INT2" => row.try_get::<i16, _>(index).map(|v| FieldValue::Int(v.into())),
        "INT4" => row.try_get::<i32, _>(index).map(|v| FieldValue::Int(v.into())),
        "INT8" => row.try_get::<i64, _>(index).map(FieldValue::Int),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| FieldValue::Float(v.into())),
        "FLOAT8" => row.try_get::<f64, _>(index).map(FieldValue::Float),
        "BOOL" => row.try_get::<bool, _>(index).map(FieldValue::Bool),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<String, _>(index).map(FieldValue::Text)
        }
        "NUMERIC" => row
            .try_get::<Decimal, _>(index)
            .map(|v| FieldValue::Text(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|v| FieldValue::Text(v.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|v| FieldValue::Text(v.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|v| FieldValue::Text(v.to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|v| FieldValue::Text(v.to_string())),
        "UUID" => row
            .try_get::<Uuid, _>(index)
            .map(|v| FieldValue::Text(v.hyphenated().to_string())),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(index)
            .map(|v| FieldValue::Text(v.to_string())),
        _ => return fallback(raw, &type_name),
    };

    converted.unwrap_or_else(|e| {
        tracing::warn!(index, type_name, error = %e, "Failed to decode column");
        FieldValue::Null
    })
}

fn fallback(raw: PgValueRef<'_>, type_name: &str) -> FieldValue {
    // Result columns normally arrive in binary format; those bytes are not text.
    if raw.format() == PgValueFormat::Text {
        if let Ok(text) = raw.as_str() {
            tracing::warn!(type_name, "Unhandled column type, falling back to text");
            return FieldValue::Text(text.to_string());
        }
    }
    tracing::warn!(type_name, "Unhandled column type, returning null");
    FieldValue::Null
}
