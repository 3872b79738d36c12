//! Deploy ingest
//!
//! A deploy arrives as a ZIP archive or a set of multipart files, is
//! validated against per-file and aggregate size limits, and replaces the
//! app's file set in one transaction. The `source_commit` is a Merkle-style
//! blake3 hash over the sorted file set, so deploying identical content
//! twice is observably idempotent.

use std::io::{Read, Seek};

use serde_json::Value;

use super::Vfs;
use crate::apps;
use crate::db::{now_secs, with_busy_retry};
use crate::error::{Error, Result};

/// One incoming file.
#[derive(Debug)]
pub struct FileUpload {
    pub path: String,
    pub content: Vec<u8>,
}

/// A validated file ready for insertion.
#[derive(Debug)]
pub(crate) struct StoredFile {
    pub path: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// Deploy result summary.
#[derive(Debug, serde::Serialize)]
pub struct DeploySummary {
    pub app_id: String,
    pub files: usize,
    pub bytes: u64,
    pub source_commit: String,
}

/// Unpack a ZIP archive into uploads. Directory entries are skipped; paths
/// are normalized and traversal is rejected.
pub fn unpack_zip<R: Read + Seek>(reader: R) -> Result<Vec<FileUpload>> {
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| Error::BadRequest(format!("invalid zip archive: {e}")))?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::BadRequest(format!("corrupt zip entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(Error::BadRequest(format!(
                "zip entry escapes the archive root: {}",
                entry.name()
            )));
        };
        let path = enclosed
            .to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches('/')
            .to_string();
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut content)
            .map_err(|e| Error::BadRequest(format!("failed to read zip entry {path}: {e}")))?;
        files.push(FileUpload { path, content });
    }
    Ok(files)
}

/// Normalize and validate an upload path.
fn check_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(Error::BadRequest(format!("invalid file path: {path}")));
    }
    Ok(())
}

/// Merkle-style content hash over the sorted file set.
fn source_commit(files: &[StoredFile]) -> String {
    let mut hasher = blake3::Hasher::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update(&[0]);
        hasher.update(blake3::hash(&file.content).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

impl Vfs {
    /// Deploy `uploads` onto `app_id`, replacing the whole file set.
    ///
    /// Validates every file against `max_file_size` and the aggregate
    /// against `max_site_size` before any row changes; a rejected deploy
    /// leaves the app untouched. A `manifest.json` at the archive root
    /// updates app flags and `source_ref`.
    pub async fn deploy(
        &self,
        app_id: &str,
        mut uploads: Vec<FileUpload>,
    ) -> Result<DeploySummary> {
        let app = apps::get(self.pool(), app_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("app {app_id}")))?;

        uploads.sort_by(|a, b| a.path.cmp(&b.path));

        let mut total: u64 = 0;
        let mut files = Vec::with_capacity(uploads.len());
        let mut manifest: Option<Value> = None;

        for upload in uploads {
            check_path(&upload.path)?;
            let size = upload.content.len() as u64;
            if size > self.limits().storage.max_file_size {
                return Err(Error::PayloadTooLarge(format!(
                    "{} is {size} bytes; limit is {}",
                    upload.path,
                    self.limits().storage.max_file_size
                )));
            }
            total += size;
            if total > self.limits().storage.max_site_size {
                return Err(Error::PayloadTooLarge(format!(
                    "deploy exceeds the {} byte site limit",
                    self.limits().storage.max_site_size
                )));
            }
            if upload.path == "manifest.json" {
                manifest = Some(serde_json::from_slice(&upload.content).map_err(|e| {
                    Error::BadRequest(format!("manifest.json is not valid JSON: {e}"))
                })?);
            }
            let mime_type = mime_guess::from_path(&upload.path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            files.push(StoredFile { path: upload.path, content: upload.content, mime_type });
        }

        let commit = source_commit(&files);

        with_busy_retry(|| self.replace_files(&app.id, &files)).await?;

        let source_ref = manifest
            .as_ref()
            .and_then(|m| m.get("ref"))
            .and_then(Value::as_str)
            .map(str::to_string);
        sqlx::query(
            "UPDATE apps SET source_commit = ?, source_ref = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&commit)
        .bind(&source_ref)
        .bind(now_secs())
        .bind(&app.id)
        .execute(self.pool())
        .await?;

        if let Some(manifest) = &manifest {
            apps::apply_manifest(self.pool(), &app.id, manifest).await?;
        }

        self.invalidate(&app.id);
        tracing::info!(app = %app.name, files = files.len(), bytes = total, commit = %commit, "deployed");

        Ok(DeploySummary {
            app_id: app.id,
            files: files.len(),
            bytes: total,
            source_commit: commit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::vfs;
    use super::*;
    use crate::apps;
    use std::io::Cursor;
    use std::io::Write as _;

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (path, content) in entries {
                writer.start_file(*path, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_unpack_zip() {
        let bytes = make_zip(&[("index.html", b"hi"), ("api/main.js", b"x")]);
        let files = unpack_zip(Cursor::new(bytes)).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.path == "api/main.js"));
    }

    #[test]
    fn test_check_path_rejects_traversal() {
        assert!(check_path("ok/file.txt").is_ok());
        assert!(check_path("../escape").is_err());
        assert!(check_path("/abs").is_err());
        assert!(check_path("a//b").is_err());
    }

    #[tokio::test]
    async fn test_deploy_replaces_file_set() {
        let (db, vfs) = vfs().await;
        let app = apps::create(&db.pool, "site", "personal").await.unwrap();

        vfs.deploy(
            &app.id,
            vec![
                FileUpload { path: "index.html".into(), content: b"v1".to_vec() },
                FileUpload { path: "old.txt".into(), content: b"old".to_vec() },
            ],
        )
        .await
        .unwrap();

        vfs.deploy(
            &app.id,
            vec![FileUpload { path: "index.html".into(), content: b"v2".to_vec() }],
        )
        .await
        .unwrap();

        assert_eq!(
            &*vfs.read(&app.id, "index.html").await.unwrap().unwrap().bytes,
            b"v2"
        );
        assert!(vfs.read(&app.id, "old.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_idempotent_commit() {
        let (db, vfs) = vfs().await;
        let app = apps::create(&db.pool, "site", "personal").await.unwrap();

        let files = || {
            vec![
                FileUpload { path: "a.txt".into(), content: b"a".to_vec() },
                FileUpload { path: "b.txt".into(), content: b"b".to_vec() },
            ]
        };
        let first = vfs.deploy(&app.id, files()).await.unwrap();
        let second = vfs.deploy(&app.id, files()).await.unwrap();
        assert_eq!(first.source_commit, second.source_commit);

        // Order of upload does not matter.
        let reversed = vfs
            .deploy(
                &app.id,
                vec![
                    FileUpload { path: "b.txt".into(), content: b"b".to_vec() },
                    FileUpload { path: "a.txt".into(), content: b"a".to_vec() },
                ],
            )
            .await
            .unwrap();
        assert_eq!(first.source_commit, reversed.source_commit);
    }

    #[tokio::test]
    async fn test_deploy_rejects_oversize_atomically() {
        let (db, vfs) = vfs().await;
        let app = apps::create(&db.pool, "site", "personal").await.unwrap();

        vfs.deploy(
            &app.id,
            vec![FileUpload { path: "keep.txt".into(), content: b"keep".to_vec() }],
        )
        .await
        .unwrap();

        let too_big = vfs.limits().storage.max_file_size as usize + 1;
        let err = vfs
            .deploy(
                &app.id,
                vec![
                    FileUpload { path: "a.txt".into(), content: b"a".to_vec() },
                    FileUpload { path: "big.bin".into(), content: vec![0; too_big] },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PayloadTooLarge);

        // Previous set untouched.
        assert!(vfs.read(&app.id, "keep.txt").await.unwrap().is_some());
        assert!(vfs.read(&app.id, "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_applies_manifest() {
        let (db, vfs) = vfs().await;
        let app = apps::create(&db.pool, "site", "personal").await.unwrap();

        vfs.deploy(
            &app.id,
            vec![FileUpload {
                path: "manifest.json".into(),
                content: br#"{"spa_mode": true, "ref": "main"}"#.to_vec(),
            }],
        )
        .await
        .unwrap();

        let app = apps::get(&db.pool, &app.id).await.unwrap().unwrap();
        assert!(app.spa_mode);
        assert_eq!(app.source_ref.as_deref(), Some("main"));
        assert!(app.source_commit.is_some());
    }
}
