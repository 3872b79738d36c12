//! Egress proxy
//!
//! The only path from user code to the network. Every call is gated by the
//! allowlist, the SSRF IP guard, per-domain rate limits, per-app and global
//! concurrency counters, and the caller's execution budget. Redirects are
//! followed manually so each hop re-runs the full validation. Secrets are
//! injected server-side; JS never sees credential values.

pub mod allowlist;
pub mod cache;
pub mod ipguard;
pub mod log;
pub mod ratelimit;
pub mod secrets;

pub use allowlist::{Allowlist, AllowlistEntry};
pub use log::{NetLog, NetLogEntry};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use url::Url;

use crate::error::NetError;
use crate::limits::Limits;
use crate::runtime::budget::Budget;
use allowlist::canonical_host;
use cache::{CachedResponse, ResponseCache};
use ratelimit::DomainRateLimits;
use secrets::InjectAs;

/// Grace subtracted from the remaining budget so the handler can still
/// finish after a slow call.
const BUDGET_GRACE: Duration = Duration::from_millis(500);

/// Request options from the JS bridge.
#[derive(Debug, Default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Name of a stored secret to inject
    pub auth: Option<String>,
}

/// Proxy response handed back to JS.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Lowercased names, first value per name
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

/// The proxy singleton.
pub struct EgressProxy {
    pool: sqlx::SqlitePool,
    allowlist: Allowlist,
    rate: DomainRateLimits,
    cache: ResponseCache,
    log: NetLog,
    limits: Arc<Limits>,
    global_inflight: Arc<AtomicU32>,
    app_inflight: DashMap<String, Arc<AtomicU32>>,
}

struct InflightGuard {
    global: Arc<AtomicU32>,
    app: Arc<AtomicU32>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        self.app.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EgressProxy {
    pub fn new(pool: sqlx::SqlitePool, limits: Arc<Limits>, log: NetLog) -> Self {
        Self {
            allowlist: Allowlist::new(pool.clone()),
            rate: DomainRateLimits::new(limits.net.rate_limit, limits.net.rate_burst),
            cache: ResponseCache::new(limits.net.cache_max_items, limits.net.cache_max_bytes),
            pool,
            log,
            limits,
            global_inflight: Arc::new(AtomicU32::new(0)),
            app_inflight: DashMap::new(),
        }
    }

    /// The allowlist, for admin endpoints. Mutations also reset rate
    /// buckets since overrides may have changed.
    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    /// Reset per-domain rate buckets after allowlist mutation.
    pub fn reset_rate_buckets(&self) {
        self.rate.reset();
    }

    /// The response cache, for admin endpoints.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Perform one outbound call on behalf of `app_id`.
    pub async fn fetch(
        &self,
        app_id: &str,
        raw_url: &str,
        opts: FetchOptions,
        budget: &Budget,
    ) -> Result<FetchResponse, NetError> {
        let started = Instant::now();
        let url = Url::parse(raw_url).map_err(|e| NetError::blocked(format!("invalid URL: {e}")))?;

        let method = opts
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let host = url
            .host_str()
            .ok_or_else(|| NetError::blocked("URL has no host"))?
            .to_string();

        let mut entry_log = NetLogEntry::new(app_id, &method, &host, url.path());
        let result = self.fetch_inner(app_id, url, &method, opts, budget).await;

        entry_log.duration_ms = Some(started.elapsed().as_millis() as i64);
        match &result {
            Ok(resp) => {
                entry_log.status = Some(resp.status as i64);
                entry_log.bytes_in = Some(resp.body.len() as i64);
            }
            Err(e) => entry_log.error = Some(e.code.to_string()),
        }
        self.log.record(entry_log);
        result
    }

    async fn fetch_inner(
        &self,
        app_id: &str,
        url: Url,
        method: &str,
        opts: FetchOptions,
        budget: &Budget,
    ) -> Result<FetchResponse, NetError> {
        // Body size before anything else touches the network.
        if let Some(body) = &opts.body {
            if body.len() as u64 > self.limits.net.max_request_body {
                return Err(NetError::size(format!(
                    "request body of {} bytes exceeds the {} byte limit",
                    body.len(),
                    self.limits.net.max_request_body
                )));
            }
        }

        let host = canonical_host(url.host_str().unwrap_or(""));
        let entry = self.check_target(app_id, &url, &host).await?;

        // Rate limit for the first hop's domain.
        self.rate
            .check(
                &host,
                entry.rate_limit.map(|v| v as u32),
                entry.rate_burst.map(|v| v as u32),
            )
            .map_err(|wait| NetError::rate(format!("rate limit for {host}"), wait))?;

        // Budget admission.
        let remaining = budget.remaining();
        if remaining < Duration::from_millis(self.limits.net.min_net_time_ms) {
            return Err(NetError::budget("insufficient budget for a network call"));
        }
        let call_cap = entry
            .timeout_ms
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(Duration::from_millis(self.limits.net.call_timeout_ms));
        let timeout = remaining.saturating_sub(BUDGET_GRACE).min(call_cap);
        if timeout.is_zero() {
            return Err(NetError::budget("insufficient budget for a network call"));
        }

        // Concurrency admission.
        let _guard = self.admit(app_id)?;

        // Cache: unauthenticated GETs on opted-in domains.
        let cacheable = method == "GET" && opts.auth.is_none() && entry.cache_ttl.unwrap_or(0) > 0;
        let cache_key = ResponseCache::key("GET", &host, url.path(), url.query());
        if cacheable {
            if let Some(hit) = self.cache.get(&cache_key) {
                return Ok(FetchResponse {
                    status: hit.status,
                    headers: hit.headers,
                    body: hit.body,
                    from_cache: true,
                });
            }
        }

        // Secret resolution against the original host.
        let secret = match &opts.auth {
            Some(name) => Some(
                secrets::resolve_secret(&self.pool, app_id, name, &host)
                    .await
                    .map_err(|e| match e {
                        crate::error::Error::Net(net) => net,
                        other => NetError::other(other.to_string()),
                    })?,
            ),
            None => None,
        };

        let response = self
            .execute_with_redirects(app_id, url, method, &opts, secret, &host, timeout)
            .await?;

        if cacheable && response.status == 200 {
            let ttl = Duration::from_secs(entry.cache_ttl.unwrap_or(0) as u64);
            self.cache.put(
                cache_key,
                CachedResponse {
                    status: response.status,
                    headers: response.headers.clone(),
                    body: response.body.clone(),
                },
                ttl,
            );
        }
        Ok(response)
    }

    /// Scheme, allowlist and IP-literal checks for one hop's target.
    async fn check_target(
        &self,
        app_id: &str,
        url: &Url,
        host: &str,
    ) -> Result<AllowlistEntry, NetError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(NetError::blocked(format!("scheme '{other}' not allowed"))),
        }
        if ipguard::is_ip_literal(host) {
            return Err(NetError::blocked("IP-literal URLs are not allowed"));
        }
        let entry = self
            .allowlist
            .lookup(app_id, host)
            .await
            .map_err(|e| NetError::other(format!("allowlist lookup failed: {e}")))?
            .ok_or_else(|| NetError::blocked(format!("'{host}' is not allowlisted")))?;
        if entry.https_only && url.scheme() != "https" {
            return Err(NetError::blocked(format!("'{host}' requires https")));
        }
        Ok(entry)
    }

    /// Resolve and validate every address for a host.
    async fn resolve_checked(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| NetError::other(format!("DNS resolution failed for {host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::other(format!("{host} resolved to no addresses")));
        }
        for addr in &addrs {
            if let Some(reason) = ipguard::check_ip(addr.ip()) {
                return Err(NetError::blocked(format!(
                    "{host} resolves to a blocked address ({reason})"
                )));
            }
        }
        Ok(addrs)
    }

    fn admit(&self, app_id: &str) -> Result<InflightGuard, NetError> {
        let app_counter = self
            .app_inflight
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        let global = self.global_inflight.fetch_add(1, Ordering::SeqCst) + 1;
        let app = app_counter.fetch_add(1, Ordering::SeqCst) + 1;
        // The guard must exist before any early return so counts unwind.
        let guard = InflightGuard {
            global: self.global_inflight.clone(),
            app: app_counter,
        };

        if global > self.limits.net.concurrency {
            return Err(NetError::limit("global egress concurrency reached"));
        }
        if app > self.limits.net.app_concurrency {
            return Err(NetError::limit("per-app egress concurrency reached"));
        }
        Ok(guard)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_with_redirects(
        &self,
        app_id: &str,
        mut url: Url,
        original_method: &str,
        opts: &FetchOptions,
        secret: Option<(String, InjectAs, Option<String>)>,
        original_host: &str,
        timeout: Duration,
    ) -> Result<FetchResponse, NetError> {
        let deadline = Instant::now() + timeout;
        let mut method = original_method.to_string();
        let mut send_body = true;

        for _hop in 0..=self.limits.net.max_redirects {
            let host = canonical_host(url.host_str().unwrap_or(""));
            // Every hop re-runs scheme + allowlist + IP validation.
            self.check_target(app_id, &url, &host).await?;
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs = self.resolve_checked(&host, port).await?;

            let hop_timeout = deadline.saturating_duration_since(Instant::now());
            if hop_timeout.is_zero() {
                return Err(NetError::timeout("call budget exhausted"));
            }

            let response = self
                .send_once(
                    &url,
                    &method,
                    opts,
                    send_body,
                    secret.as_ref().filter(|_| host == original_host),
                    &host,
                    &addrs,
                    hop_timeout,
                )
                .await?;

            if let Some(location) = redirect_location(&response) {
                url = url
                    .join(&location)
                    .map_err(|e| NetError::other(format!("bad redirect location: {e}")))?;
                // 307/308 preserve the method and body; other 3xx degrade
                // to GET.
                if !matches!(response.status, 307 | 308) {
                    method = "GET".to_string();
                    send_body = false;
                }
                continue;
            }
            return Ok(response);
        }
        Err(NetError::blocked(format!(
            "redirect chain exceeded {} hops",
            self.limits.net.max_redirects
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        url: &Url,
        method: &str,
        opts: &FetchOptions,
        send_body: bool,
        secret: Option<&(String, InjectAs, Option<String>)>,
        host: &str,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<FetchResponse, NetError> {
        // The client pins the validated addresses, so the connection goes
        // exactly where the IP guard looked.
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .resolve_to_addrs(host, addrs)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|e| NetError::other(format!("client build failed: {e}")))?;

        let mut target = url.clone();
        let reqwest_method: reqwest::Method = method
            .parse()
            .map_err(|_| NetError::other(format!("invalid method: {method}")))?;

        // Query-mode secrets extend the URL before the request is built.
        if let Some((value, InjectAs::Query, key)) = secret {
            let key = key.as_deref().unwrap_or("key");
            target.query_pairs_mut().append_pair(key, value);
        }

        let mut request = client
            .request(reqwest_method, target.as_str())
            .header(http::header::ACCEPT_ENCODING, "identity");

        for (name, value) in &opts.headers {
            if is_forbidden_header(name) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        match secret {
            Some((value, InjectAs::Bearer, _)) => {
                request = request.header(http::header::AUTHORIZATION, format!("Bearer {value}"));
            }
            Some((value, InjectAs::Header, key)) => {
                let key = key.as_deref().unwrap_or("X-Api-Key");
                request = request.header(key, value.as_str());
            }
            _ => {}
        }

        if send_body {
            if let Some(body) = &opts.body {
                request = request.body(body.clone());
            }
        }

        let mut response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::timeout(format!("request to {host} timed out"))
            } else {
                NetError::other(format!("request to {host} failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .fold(Vec::<(String, String)>::new(), |mut acc, (name, value)| {
                if !acc.iter().any(|(n, _)| n == &name) {
                    acc.push((name, value));
                }
                acc
            });

        let cap = self.limits.net.max_response as usize;
        let mut body = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    NetError::timeout(format!("response from {host} timed out"))
                } else {
                    NetError::other(format!("response read failed: {e}"))
                }
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > cap {
                return Err(NetError::size(format!(
                    "response exceeds the {cap} byte limit"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse { status, headers, body, from_cache: false })
    }
}

fn redirect_location(response: &FetchResponse) -> Option<String> {
    if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    response
        .headers
        .iter()
        .find(|(name, _)| name == "location")
        .map(|(_, value)| value.clone())
}

fn is_forbidden_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "host" | "connection" | "transfer-encoding" | "accept-encoding" | "content-length"
    ) || lower.starts_with("proxy-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_headers() {
        assert!(is_forbidden_header("Host"));
        assert!(is_forbidden_header("Proxy-Authorization"));
        assert!(is_forbidden_header("accept-encoding"));
        assert!(!is_forbidden_header("X-Custom"));
    }

    #[test]
    fn test_redirect_location_detection() {
        let resp = FetchResponse {
            status: 302,
            headers: vec![("location".to_string(), "https://next.example/".to_string())],
            body: vec![],
            from_cache: false,
        };
        assert_eq!(redirect_location(&resp).as_deref(), Some("https://next.example/"));

        let ok = FetchResponse { status: 200, headers: vec![], body: vec![], from_cache: false };
        assert!(redirect_location(&ok).is_none());
    }
}
