//! HTTP client for a fazt instance
//!
//! Targets are either the local instance (implicit) or a stored peer named
//! with `@peer`. Peer records live in the local database; the token is sent
//! as a bearer credential.

use anyhow::{anyhow, bail, Context};
use serde_json::Value;

/// A resolved target.
pub struct ApiClient {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
    /// Peer name when remote; errors are reported with exit code 2.
    remote: Option<String>,
}

impl ApiClient {
    /// The local instance: `http://127.0.0.1:8080` (or `FAZT_URL`), with
    /// `FAZT_ADMIN_TOKEN` when set.
    pub fn local() -> Self {
        let base = std::env::var("FAZT_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: std::env::var("FAZT_ADMIN_TOKEN").ok(),
            http: reqwest::Client::new(),
            remote: None,
        }
    }

    /// Resolve `@name` (or the default peer when `name` is empty) from the
    /// local database.
    pub async fn peer(db: Option<std::path::PathBuf>, name: &str) -> anyhow::Result<Self> {
        let config = fazt_core::BootConfig::load_with_db(db)?;
        let database = fazt_core::db::Database::open(&config.db_path).await?;
        let peer = if name.is_empty() {
            fazt_core::peers::default_peer(&database.pool)
                .await?
                .ok_or_else(|| anyhow!("no default peer configured"))?
        } else {
            fazt_core::peers::get(&database.pool, name)
                .await?
                .ok_or_else(|| anyhow!("unknown peer: {name}"))?
        };
        Ok(Self {
            base: peer.url.clone(),
            token: Some(peer.token.clone()),
            http: reqwest::Client::new(),
            remote: Some(peer.name),
        })
    }

    /// Resolve a `--peer @name` style option: absent means local.
    pub async fn resolve(
        db: Option<std::path::PathBuf>,
        peer: Option<&str>,
    ) -> anyhow::Result<Self> {
        match peer {
            Some(spec) => Self::peer(db, spec.trim_start_matches('@')).await,
            None => Ok(Self::local()),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn finish(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let response = builder.send().await.with_context(|| {
            match &self.remote {
                Some(peer) => format!("remote: peer '{peer}' unreachable"),
                None => "local instance unreachable (is `fazt serve` running?)".to_string(),
            }
        })?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let code = body["error"]["code"].as_str().unwrap_or("UNKNOWN");
            let message = body["error"]["message"].as_str().unwrap_or("request failed");
            let prefix = if self.remote.is_some() { "remote: " } else { "" };
            bail!("{prefix}{code}: {message}");
        }
        Ok(body["data"].clone())
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.finish(self.request(reqwest::Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.finish(self.request(reqwest::Method::POST, path).json(body)).await
    }

    pub async fn post_bytes(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<Value> {
        self.finish(
            self.request(reqwest::Method::POST, path)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
        )
        .await
    }

    pub async fn put(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.finish(self.request(reqwest::Method::PUT, path).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        self.finish(self.request(reqwest::Method::DELETE, path)).await
    }

    pub async fn get_bytes(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        if !response.status().is_success() {
            bail!("fetch {path} failed: {}", response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }
}
