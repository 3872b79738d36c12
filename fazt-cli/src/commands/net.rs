//! `fazt net ...`

use clap::Subcommand;
use serde_json::{json, Value};

use super::Ctx;
use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum NetCommands {
    /// Allow a domain for egress
    Allow {
        domain: String,
        /// Restrict to one app (id or name); global otherwise
        #[arg(long)]
        app: Option<String>,
        /// Permit plain http
        #[arg(long)]
        allow_http: bool,
        /// Cache GET responses for this many seconds
        #[arg(long)]
        cache_ttl: Option<i64>,
        /// Requests per second for this domain
        #[arg(long)]
        rate: Option<i64>,
        #[arg(long)]
        peer: Option<String>,
    },
    /// List allowlist entries
    List {
        #[arg(long)]
        peer: Option<String>,
    },
    /// Remove an allowlist entry by id
    Remove {
        id: i64,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show recent egress log entries
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: u64,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show or clear the egress response cache
    Cache {
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        peer: Option<String>,
    },
}

pub async fn execute(ctx: Ctx, command: NetCommands) -> anyhow::Result<()> {
    match command {
        NetCommands::Allow { domain, app, allow_http, cache_ttl, rate, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let entry = client
                .post(
                    "/api/net/allowlist",
                    &json!({
                        "domain": domain,
                        "app_id": app,
                        "https_only": !allow_http,
                        "cache_ttl": cache_ttl,
                        "rate_limit": rate,
                    }),
                )
                .await?;
            output::object(ctx.format, &entry);
            Ok(())
        }
        NetCommands::List { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let entries = client.get("/api/net/allowlist").await?;
            let rows: Vec<Value> = entries.as_array().cloned().unwrap_or_default();
            output::table(
                ctx.format,
                &["id", "domain", "app_id", "https_only", "cache_ttl", "rate_limit"],
                &rows,
            );
            Ok(())
        }
        NetCommands::Remove { id, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = client.delete(&format!("/api/net/allowlist/{id}")).await?;
            output::object(ctx.format, &result);
            Ok(())
        }
        NetCommands::Logs { limit, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let logs = client.get(&format!("/api/net/logs?limit={limit}")).await?;
            let rows: Vec<Value> = logs.as_array().cloned().unwrap_or_default();
            output::table(
                ctx.format,
                &["ts", "app_id", "method", "host", "path", "status", "duration_ms", "error"],
                &rows,
            );
            Ok(())
        }
        NetCommands::Cache { clear, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = if clear {
                client.delete("/api/net/cache").await?
            } else {
                client.get("/api/net/cache").await?
            };
            output::object(ctx.format, &result);
            Ok(())
        }
    }
}
