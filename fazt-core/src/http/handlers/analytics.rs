//! Analytics endpoints over the activity log

use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::http::envelope::{Data, Page};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    100
}

/// `GET /api/analytics/events`
pub async fn events(
    State(state): State<SharedState>,
    Query(query): Query<EventsQuery>,
) -> Result<Page<Vec<Value>>> {
    let limit = query.limit.min(1000);

    // Filters compose as SQL fragments; both are optional.
    let mut where_clause = String::from("WHERE 1=1");
    if query.app_id.is_some() {
        where_clause.push_str(" AND app_id = ?");
    }
    if query.event_type.is_some() {
        where_clause.push_str(" AND type = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM activity_log {where_clause}");
    let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
    if let Some(app_id) = &query.app_id {
        count_query = count_query.bind(app_id);
    }
    if let Some(event_type) = &query.event_type {
        count_query = count_query.bind(event_type);
    }
    let (total,) = count_query.fetch_one(&state.db.admin_pool).await?;

    let rows_sql = format!(
        "SELECT id, ts, app_id, user_id, type, action, actor, weight, path, status, duration_ms, details \
         FROM activity_log {where_clause} ORDER BY id DESC LIMIT ? OFFSET ?"
    );
    let mut rows_query = sqlx::query_as::<
        _,
        (
            i64,
            i64,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
            i64,
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<String>,
        ),
    >(&rows_sql);
    if let Some(app_id) = &query.app_id {
        rows_query = rows_query.bind(app_id);
    }
    if let Some(event_type) = &query.event_type {
        rows_query = rows_query.bind(event_type);
    }
    let rows = rows_query
        .bind(limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&state.db.admin_pool)
        .await?;

    let items = rows
        .into_iter()
        .map(
            |(id, ts, app_id, user_id, event_type, action, actor, weight, path, status, duration_ms, details)| {
                json!({
                    "id": id,
                    "ts": ts,
                    "app_id": app_id,
                    "user_id": user_id,
                    "type": event_type,
                    "action": action,
                    "actor": actor,
                    "weight": weight,
                    "path": path,
                    "status": status,
                    "duration_ms": duration_ms,
                    "details": details.and_then(|d| serde_json::from_str::<Value>(&d).ok()),
                })
            },
        )
        .collect();

    Ok(Page { items, total: total as u64, limit, offset: query.offset })
}

/// `GET /api/analytics/stats` — totals plus a 24-hour window, grouped by
/// type and by app.
pub async fn stats(State(state): State<SharedState>) -> Result<Data<Value>> {
    let day_ago = crate::db::now_secs() - 86_400;

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM activity_log")
        .fetch_one(&state.db.admin_pool)
        .await?;
    let (last_day,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM activity_log WHERE ts >= ?")
            .bind(day_ago)
            .fetch_one(&state.db.admin_pool)
            .await?;

    let by_type: Vec<(String, i64)> = sqlx::query_as(
        "SELECT type, COUNT(*) FROM activity_log WHERE ts >= ? GROUP BY type ORDER BY 2 DESC",
    )
    .bind(day_ago)
    .fetch_all(&state.db.admin_pool)
    .await?;

    let by_app: Vec<(Option<String>, i64)> = sqlx::query_as(
        "SELECT app_id, COUNT(*) FROM activity_log WHERE ts >= ? AND app_id IS NOT NULL \
         GROUP BY app_id ORDER BY 2 DESC LIMIT 20",
    )
    .bind(day_ago)
    .fetch_all(&state.db.admin_pool)
    .await?;

    Ok(Data(json!({
        "total": total,
        "last_24h": last_day,
        "by_type": by_type.into_iter().map(|(t, n)| json!({ "type": t, "count": n })).collect::<Vec<_>>(),
        "by_app": by_app.into_iter().map(|(a, n)| json!({ "app_id": a, "count": n })).collect::<Vec<_>>(),
    })))
}
