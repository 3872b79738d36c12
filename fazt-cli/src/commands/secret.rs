//! `fazt secret ...`

use clap::Subcommand;
use serde_json::{json, Value};

use super::Ctx;
use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Store a secret for egress injection
    Set {
        name: String,
        value: String,
        /// Restrict to one app; global otherwise
        #[arg(long)]
        app: Option<String>,
        /// bearer | header | query
        #[arg(long, default_value = "bearer")]
        inject_as: String,
        /// Header or query key for header/query injection
        #[arg(long)]
        key: Option<String>,
        /// Restrict to one domain
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        peer: Option<String>,
    },
    /// List secrets (names only)
    List {
        #[arg(long)]
        peer: Option<String>,
    },
    /// Remove a secret
    Remove {
        name: String,
        #[arg(long)]
        app: Option<String>,
        #[arg(long)]
        peer: Option<String>,
    },
}

pub async fn execute(ctx: Ctx, command: SecretCommands) -> anyhow::Result<()> {
    match command {
        SecretCommands::Set { name, value, app, inject_as, key, domain, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = client
                .put(
                    "/api/net/secrets",
                    &json!({
                        "name": name,
                        "value": value,
                        "app_id": app,
                        "inject_as": inject_as,
                        "inject_key": key,
                        "domain": domain,
                    }),
                )
                .await?;
            output::object(ctx.format, &result);
            Ok(())
        }
        SecretCommands::List { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let listed = client.get("/api/net/secrets").await?;
            let rows: Vec<Value> = listed.as_array().cloned().unwrap_or_default();
            output::table(ctx.format, &["name", "app_id", "inject_as", "domain"], &rows);
            Ok(())
        }
        SecretCommands::Remove { name, app, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let path = match app {
                Some(app) => format!("/api/net/secrets/{name}?app_id={app}"),
                None => format!("/api/net/secrets/{name}"),
            };
            let result = client.delete(&path).await?;
            output::object(ctx.format, &result);
            Ok(())
        }
    }
}
