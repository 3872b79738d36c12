use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

mod client;
mod commands;
mod output;

use commands::{app, net, peer, secret, server, sql};

/// fazt - single-binary personal application platform
#[derive(Parser)]
#[command(name = "fazt")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (local commands); overrides FAZT_DB_PATH
    #[arg(long, global = true)]
    db: Option<std::path::PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "markdown")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve,
    /// App management: deploy, install, pull, upgrade, remove, info, list
    App {
        #[command(subcommand)]
        command: app::AppCommands,
    },
    /// Peer management: add, list, remove, default, status
    Peer {
        #[command(subcommand)]
        command: peer::PeerCommands,
    },
    /// Server maintenance: install, upgrade, vacuum, prune, status
    Server {
        #[command(subcommand)]
        command: server::ServerCommands,
    },
    /// Run a SQL statement against the instance
    Sql {
        /// The statement; reads only unless --write
        query: String,
        /// Allow write statements
        #[arg(long)]
        write: bool,
        /// Target a stored peer (`@name`)
        #[arg(long)]
        peer: Option<String>,
    },
    /// Egress management: allow, list, remove, logs, cache
    Net {
        #[command(subcommand)]
        command: net::NetCommands,
    },
    /// Egress secrets: set, list, remove
    Secret {
        #[command(subcommand)]
        command: secret::SecretCommands,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = match cli.format {
        Format::Markdown => output::Format::Markdown,
        Format::Json => output::Format::Json,
    };
    let ctx = commands::Ctx { db: cli.db, format };

    let result = match cli.command {
        Commands::Serve => serve(ctx).await,
        Commands::App { command } => app::execute(ctx, command).await,
        Commands::Peer { command } => peer::execute(ctx, command).await,
        Commands::Server { command } => server::execute(ctx, command).await,
        Commands::Sql { query, write, peer } => sql::execute(ctx, query, write, peer).await,
        Commands::Net { command } => net::execute(ctx, command).await,
        Commands::Secret { command } => secret::execute(ctx, command).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }
            // Remote failures exit 2, local/usage errors exit 1.
            let code = if e.to_string().starts_with("remote:") { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}

async fn serve(ctx: commands::Ctx) -> anyhow::Result<()> {
    fazt_core::init_tracing();
    let config = fazt_core::BootConfig::load_with_db(ctx.db)?;
    fazt_core::server::serve(config).await?;
    Ok(())
}
