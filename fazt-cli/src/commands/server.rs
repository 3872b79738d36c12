//! `fazt server ...`

use anyhow::Context;
use clap::Subcommand;
use serde_json::json;

use super::Ctx;
use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Write a systemd unit for this binary
    Install {
        /// Listen address baked into the unit
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,
        /// Unit file destination
        #[arg(long, default_value = "/etc/systemd/system/fazt.service")]
        unit: std::path::PathBuf,
    },
    /// Replace the running binary with a new build
    Upgrade {
        /// Path to the new binary
        from: std::path::PathBuf,
    },
    /// Reclaim database space
    Vacuum {
        #[arg(long)]
        peer: Option<String>,
    },
    /// Trim activity and net logs to retention
    Prune {
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show instance health
    Status {
        #[arg(long)]
        peer: Option<String>,
    },
}

pub async fn execute(ctx: Ctx, command: ServerCommands) -> anyhow::Result<()> {
    match command {
        ServerCommands::Install { listen, unit } => {
            let binary = std::env::current_exe().context("locating current binary")?;
            let unit_text = format!(
                "[Unit]\n\
                 Description=fazt personal application platform\n\
                 After=network.target\n\n\
                 [Service]\n\
                 ExecStart={} serve\n\
                 Environment=FAZT_LISTEN={}\n\
                 Restart=on-failure\n\
                 RestartSec=2\n\n\
                 [Install]\n\
                 WantedBy=multi-user.target\n",
                binary.display(),
                listen
            );
            std::fs::write(&unit, unit_text)
                .with_context(|| format!("writing {}", unit.display()))?;
            println!("wrote {}; enable with: systemctl enable --now fazt", unit.display());
            Ok(())
        }
        ServerCommands::Upgrade { from } => {
            let current = std::env::current_exe().context("locating current binary")?;
            std::fs::copy(&from, &current).with_context(|| {
                format!("replacing {} with {}", current.display(), from.display())
            })?;
            println!("binary replaced; restart the service to pick it up");
            Ok(())
        }
        ServerCommands::Vacuum { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = client.post("/api/system/vacuum", &json!({})).await?;
            output::object(ctx.format, &result);
            Ok(())
        }
        ServerCommands::Prune { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = client.post("/api/system/prune", &json!({})).await?;
            output::object(ctx.format, &result);
            Ok(())
        }
        ServerCommands::Status { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let health = client.get("/api/system/health").await?;
            output::object(ctx.format, &health);
            Ok(())
        }
    }
}
