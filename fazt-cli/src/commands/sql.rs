//! `fazt sql <query>`

use serde_json::json;

use super::Ctx;
use crate::client::ApiClient;
use crate::output;

pub async fn execute(
    ctx: Ctx,
    query: String,
    write: bool,
    peer: Option<String>,
) -> anyhow::Result<()> {
    let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
    let result = client
        .post("/api/sql", &json!({ "query": query, "write": write }))
        .await?;

    if let Some(rows) = result.get("rows").and_then(|r| r.as_array()) {
        // Columns come from the first row, in its key order.
        let columns: Vec<String> = rows
            .first()
            .and_then(|row| row.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        output::table(ctx.format, &column_refs, rows);
        if result["truncated"].as_bool().unwrap_or(false) {
            eprintln!("(result truncated)");
        }
    } else {
        output::object(ctx.format, &result);
    }
    Ok(())
}
