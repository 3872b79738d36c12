//! `fazt app ...`

use anyhow::{anyhow, bail, Context};
use clap::Subcommand;
use serde_json::json;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use super::Ctx;
use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum AppCommands {
    /// Deploy a directory (or zip) to an app, creating it when absent
    Deploy {
        /// Directory or .zip archive
        path: PathBuf,
        /// App name; defaults to the directory name
        #[arg(long)]
        name: Option<String>,
        /// Target a stored peer (`@name`)
        #[arg(long)]
        peer: Option<String>,
    },
    /// Install an app from a zip URL or local archive
    Install {
        source: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Download an app's files into a directory
    Pull {
        name: String,
        dir: PathBuf,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Re-install an app from its recorded source URL
    Upgrade {
        name: String,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Delete an app and everything it owns
    Remove {
        name: String,
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show one app
    Info {
        name: String,
        #[arg(long)]
        peer: Option<String>,
    },
    /// List apps
    List {
        #[arg(long)]
        peer: Option<String>,
    },
}

pub async fn execute(ctx: Ctx, command: AppCommands) -> anyhow::Result<()> {
    match command {
        AppCommands::Deploy { path, name, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let name = match name {
                Some(name) => name,
                None => infer_name(&path)?,
            };
            let archive = if path.is_dir() {
                zip_directory(&path)?
            } else {
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?
            };
            ensure_app(&client, &name).await?;
            let summary = client
                .post_bytes(&format!("/api/apps/{name}/deploy"), "application/zip", archive)
                .await?;
            output::object(ctx.format, &summary);
            Ok(())
        }
        AppCommands::Install { source, name, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let archive = if source.starts_with("http://") || source.starts_with("https://") {
                reqwest::get(&source)
                    .await
                    .with_context(|| format!("fetching {source}"))?
                    .bytes()
                    .await?
                    .to_vec()
            } else {
                std::fs::read(&source).with_context(|| format!("reading {source}"))?
            };
            let name = name.ok_or_else(|| anyhow!("--name is required for install"))?;
            ensure_app(&client, &name).await?;
            let summary = client
                .post_bytes(&format!("/api/apps/{name}/deploy"), "application/zip", archive)
                .await?;
            output::object(ctx.format, &summary);
            Ok(())
        }
        AppCommands::Pull { name, dir, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let files = client.get(&format!("/api/apps/{name}/files")).await?;
            let files = files.as_array().cloned().unwrap_or_default();
            std::fs::create_dir_all(&dir)?;
            for file in &files {
                let path = file["path"].as_str().unwrap_or_default();
                let bytes = client
                    .get_bytes(&format!("/api/apps/{name}/files/{path}"))
                    .await?;
                let target = dir.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, bytes)?;
            }
            println!("pulled {} files into {}", files.len(), dir.display());
            Ok(())
        }
        AppCommands::Upgrade { name, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let info = client.get(&format!("/api/apps/{name}")).await?;
            let source = info["app"]["source"].as_str().unwrap_or("");
            if !source.starts_with("http://") && !source.starts_with("https://") {
                bail!("app '{name}' has no upgradable source URL (source: {source})");
            }
            let archive = reqwest::get(source).await?.bytes().await?.to_vec();
            let summary = client
                .post_bytes(&format!("/api/apps/{name}/deploy"), "application/zip", archive)
                .await?;
            output::object(ctx.format, &summary);
            Ok(())
        }
        AppCommands::Remove { name, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let result = client.delete(&format!("/api/apps/{name}")).await?;
            output::object(ctx.format, &result);
            Ok(())
        }
        AppCommands::Info { name, peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let info = client.get(&format!("/api/apps/{name}")).await?;
            output::object(ctx.format, &info);
            Ok(())
        }
        AppCommands::List { peer } => {
            let client = ApiClient::resolve(ctx.db, peer.as_deref()).await?;
            let apps = client.get("/api/apps").await?;
            let rows = apps.as_array().cloned().unwrap_or_default();
            output::table(ctx.format, &["name", "id", "source", "source_commit"], &rows);
            Ok(())
        }
    }
}

fn infer_name(path: &Path) -> anyhow::Result<String> {
    path.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map(|n| n.trim_end_matches(".zip").to_string())
        .ok_or_else(|| anyhow!("cannot infer app name from {}; pass --name", path.display()))
}

async fn ensure_app(client: &ApiClient, name: &str) -> anyhow::Result<()> {
    if client.get(&format!("/api/apps/{name}")).await.is_ok() {
        return Ok(());
    }
    client.post("/api/apps", &json!({ "name": name })).await.map(|_| ())
}

/// Zip a directory tree, skipping dotfiles.
fn zip_directory(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)?
                .to_string_lossy()
                .replace('\\', "/");
            if rel.split('/').any(|seg| seg.starts_with('.')) {
                continue;
            }
            writer.start_file(&rel, options)?;
            writer.write_all(&std::fs::read(entry.path())?)?;
        }
        writer.finish()?;
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_directory_skips_dotfiles() {
        let dir = tempdir();
        std::fs::write(dir.join("index.html"), "hi").unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join(".git/config"), "x").unwrap();

        let bytes = zip_directory(&dir).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["index.html"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fazt-cli-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
