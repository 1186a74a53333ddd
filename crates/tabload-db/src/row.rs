//! Decode helpers over the Any driver's rows.
//!
//! Scalar projections come back with engine-specific widths (a CASE
//! expression is INT4 on PostgreSQL and INT8 on SQLite), so reads go
//! through widening fallbacks instead of a single typed get.

use sqlx::any::AnyRow;
use sqlx::Row;

use tabload_core::LoadError;

/// Read column `index` as an integer, whatever width the engine chose.
pub(crate) fn int_at(row: &AnyRow, index: usize, context: &str) -> Result<i64, LoadError> {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<i32, _>(index) {
        return Ok(v as i64);
    }
    if let Ok(v) = row.try_get::<i16, _>(index) {
        return Ok(v as i64);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Ok(v as i64);
    }
    match row.try_get::<f64, _>(index) {
        Ok(v) => Ok(v as i64),
        Err(e) => Err(LoadError::database(context.to_string(), e)),
    }
}

/// Read column `index` as display text, whatever its storage type.
pub(crate) fn text_at(row: &AnyRow, index: usize) -> String {
    if let Ok(v) = row.try_get::<String, _>(index) {
        return v;
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return v.to_string();
    }
    String::new()
}
