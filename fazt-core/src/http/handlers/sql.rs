//! SQL admin endpoint
//!
//! `POST /api/sql` runs one statement on the reserved admin pool under the
//! admin role. Reads only unless `write: true` is passed explicitly; a 30 s
//! bound and a row cap keep a bad query from wedging the dashboard.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Column, Row, TypeInfo};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::envelope::Data;
use crate::state::SharedState;

/// Statement wall-clock bound.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Row cap on result sets.
const MAX_ROWS: usize = 1000;

#[derive(Deserialize)]
pub struct SqlBody {
    pub query: String,
    #[serde(default)]
    pub write: bool,
}

/// `POST /api/sql`
pub async fn execute(
    State(state): State<SharedState>,
    Json(body): Json<SqlBody>,
) -> Result<Data<Value>> {
    let trimmed = body.query.trim();
    if trimmed.is_empty() {
        return Err(Error::BadRequest("empty query".to_string()));
    }

    let is_read = {
        let head = trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        matches!(head.as_str(), "SELECT" | "EXPLAIN" | "PRAGMA" | "WITH")
    };
    if !is_read && !body.write {
        return Err(Error::Forbidden(
            "write statements require \"write\": true".to_string(),
        ));
    }

    let pool = state.db.admin_pool.clone();
    let outcome = tokio::time::timeout(QUERY_TIMEOUT, async {
        if is_read {
            let rows = sqlx::query(trimmed).fetch_all(&pool).await?;
            let truncated = rows.len() > MAX_ROWS;
            let out: Vec<Value> = rows.iter().take(MAX_ROWS).map(row_to_json).collect();
            Ok::<Value, sqlx::Error>(json!({ "rows": out, "truncated": truncated }))
        } else {
            let result = sqlx::query(trimmed).execute(&pool).await?;
            Ok(json!({ "rows_affected": result.rows_affected() }))
        }
    })
    .await
    .map_err(|_| Error::Timeout("query exceeded 30s".to_string()))?;

    let value = outcome.map_err(|e| Error::BadRequest(format!("query failed: {e}")))?;
    Ok(Data(value))
}

/// Decode one row into a JSON object, column by column.
fn row_to_json(row: &sqlx::sqlite::SqliteRow) -> Value {
    let mut out = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(Value::from).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "REAL" => row
                .try_get::<Option<f64>, _>(name)
                .map(|v| v.map(Value::from).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "BLOB" => row
                .try_get::<Option<Vec<u8>>, _>(name)
                .map(|v| {
                    v.map(|bytes| {
                        use base64::{engine::general_purpose::STANDARD, Engine};
                        Value::String(STANDARD.encode(bytes))
                    })
                    .unwrap_or(Value::Null)
                })
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<Option<String>, _>(name)
                .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
        };
        out.insert(name.to_string(), value);
    }
    Value::Object(out)
}
