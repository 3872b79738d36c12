//! `fazt peer ...` — peer records live in the local database.

use clap::Subcommand;
use serde_json::{json, Value};

use super::Ctx;
use crate::output;
use fazt_core::{db::Database, peers, BootConfig};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Store a peer
    Add {
        name: String,
        url: String,
        /// API token for the peer
        #[arg(long)]
        token: String,
    },
    /// List stored peers
    List,
    /// Remove a peer
    Remove { name: String },
    /// Make a peer the default `@` target
    Default { name: String },
    /// Probe a peer's health endpoint
    Status { name: String },
}

async fn open(ctx: &Ctx) -> anyhow::Result<Database> {
    let config = BootConfig::load_with_db(ctx.db.clone())?;
    Ok(Database::open(&config.db_path).await?)
}

pub async fn execute(ctx: Ctx, command: PeerCommands) -> anyhow::Result<()> {
    match command {
        PeerCommands::Add { name, url, token } => {
            let db = open(&ctx).await?;
            let peer = peers::add(&db.pool, &name, &url, &token).await?;
            output::object(ctx.format, &serde_json::to_value(&peer)?);
            Ok(())
        }
        PeerCommands::List => {
            let db = open(&ctx).await?;
            let listed = peers::list(&db.pool).await?;
            let rows: Vec<Value> = listed
                .iter()
                .map(|p| {
                    json!({
                        "name": p.name,
                        "url": p.url,
                        "default": p.is_default,
                        "last_status": p.last_status,
                    })
                })
                .collect();
            output::table(ctx.format, &["name", "url", "default", "last_status"], &rows);
            Ok(())
        }
        PeerCommands::Remove { name } => {
            let db = open(&ctx).await?;
            peers::remove(&db.pool, &name).await?;
            println!("removed peer {name}");
            Ok(())
        }
        PeerCommands::Default { name } => {
            let db = open(&ctx).await?;
            peers::set_default(&db.pool, &name).await?;
            println!("default peer is now {name}");
            Ok(())
        }
        PeerCommands::Status { name } => {
            let db = open(&ctx).await?;
            let client = crate::client::ApiClient::peer(ctx.db.clone(), &name).await?;
            let status = match client.get("/api/system/health").await {
                Ok(health) => {
                    peers::record_status(&db.pool, &name, "ok").await?;
                    health
                }
                Err(e) => {
                    peers::record_status(&db.pool, &name, "unreachable").await?;
                    return Err(e);
                }
            };
            output::object(ctx.format, &status);
            Ok(())
        }
    }
}
