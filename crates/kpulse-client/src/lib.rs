//! CRM client for kpulse: gated, retried and cached HTTP calls, pagination,
//! metadata accessors and per-user connection resolution.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kpulse_core::{AuthCredential, Lead, Pipeline, PipelineStatus, StageChangeEvent, UserRef};
use kpulse_storage::{
    classify_reqwest_error, classify_status, BackoffPolicy, GateClosed, GateConfig, RequestGate,
    ResponseCache, RetryDisposition,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use url::{form_urlencoded, Url};

pub const CRATE_NAME: &str = "kpulse-client";

pub const PIPELINES_PATH: &str = "api/v4/leads/pipelines?with=statuses&limit=50";
pub const USERS_PATH: &str = "api/v4/users?limit=200";
pub const EVENTS_PATH: &str = "api/v4/events";
pub const LEADS_PATH: &str = "api/v4/leads";
pub const EVENTS_PAGE_LIMIT: u32 = 200;
pub const LEADS_PAGE_LIMIT: u32 = 250;
pub const DEFAULT_LEAD_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    /// Replaces `https://{account}.kommo.com/`; a `{account}` placeholder is substituted.
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub gate: GateConfig,
    pub backoff: BackoffPolicy,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
    pub max_pages: usize,
}

impl Default for CrmClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("kpulse/{}", env!("CARGO_PKG_VERSION"))),
            gate: GateConfig::default(),
            backoff: BackoffPolicy::default(),
            cache_capacity: 200,
            cache_ttl: Duration::from_secs(5 * 60),
            max_pages: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub account_domain: String,
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    pub auth: AuthCredential,
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
}

impl RequestDescriptor {
    pub fn get(
        account_domain: impl Into<String>,
        path: impl Into<String>,
        auth: AuthCredential,
    ) -> Self {
        Self {
            account_domain: account_domain.into(),
            path: path.into(),
            method: Method::GET,
            body: None,
            auth,
            cache_key: None,
            cache_ttl: None,
        }
    }

    pub fn with_body(mut self, method: Method, body: Value) -> Self {
        self.method = method;
        self.body = Some(body);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Explicit key, else `{account}:{path}` for body-less GETs, else none.
    pub fn effective_cache_key(&self) -> Option<String> {
        if let Some(key) = &self.cache_key {
            return Some(key.clone());
        }
        (self.method == Method::GET && self.body.is_none())
            .then(|| format!("{}:{}", self.account_domain, self.path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmErrorKind {
    Transport,
    RateLimited,
    Auth,
    Client,
    Server,
}

/// Failed CRM call. Status 0 means no HTTP response was received.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CrmRequestError {
    pub status: u16,
    pub message: String,
    pub detail: Option<Value>,
}

impl CrmRequestError {
    pub fn transport(err: &reqwest::Error) -> Self {
        Self {
            status: 0,
            message: format!("transport failure: {err}"),
            detail: None,
        }
    }

    pub fn from_status(status: StatusCode, detail: Option<Value>) -> Self {
        let message = match status.canonical_reason() {
            Some(reason) => format!("{} {reason}", status.as_u16()),
            None => status.as_u16().to_string(),
        };
        Self {
            status: status.as_u16(),
            message,
            detail,
        }
    }

    pub fn kind(&self) -> CrmErrorKind {
        match self.status {
            0 => CrmErrorKind::Transport,
            429 => CrmErrorKind::RateLimited,
            401 | 403 => CrmErrorKind::Auth,
            500..=599 => CrmErrorKind::Server,
            _ => CrmErrorKind::Client,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind() == CrmErrorKind::Auth
    }

    pub fn is_rate_limit_error(&self) -> bool {
        self.kind() == CrmErrorKind::RateLimited
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] CrmRequestError),
    #[error("decoding CRM response for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid CRM url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("pagination of {path} exceeded {limit} pages")]
    PageLimitExceeded { path: String, limit: usize },
    #[error(transparent)]
    GateClosed(#[from] GateClosed),
    #[error("building http client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ClientError {
    pub fn crm(&self) -> Option<&CrmRequestError> {
        match self {
            Self::Request(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        self.crm().is_some_and(CrmRequestError::is_auth_error)
    }

    pub fn is_rate_limit_error(&self) -> bool {
        self.crm().is_some_and(CrmRequestError::is_rate_limit_error)
    }
}

struct AttemptFailure {
    error: CrmRequestError,
    disposition: RetryDisposition,
}

#[derive(Debug, Deserialize)]
struct Page<E> {
    #[serde(rename = "_embedded")]
    embedded: Option<E>,
    #[serde(rename = "_links")]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<PageLink>,
}

#[derive(Debug, Deserialize)]
struct PageLink {
    href: String,
}

pub struct CrmClient {
    http: reqwest::Client,
    gate: Arc<RequestGate>,
    cache: ResponseCache<Value>,
    backoff: BackoffPolicy,
    base_url: Option<String>,
    max_pages: usize,
}

impl CrmClient {
    pub fn new(config: CrmClientConfig) -> Result<Self, ClientError> {
        let gate = Arc::new(RequestGate::new(config.gate));
        Self::with_gate(config, gate)
    }

    pub fn with_gate(config: CrmClientConfig, gate: Arc<RequestGate>) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build().map_err(ClientError::Build)?;

        Ok(Self {
            http,
            gate,
            cache: ResponseCache::new(config.cache_capacity, config.cache_ttl),
            backoff: config.backoff,
            base_url: config.base_url,
            max_pages: config.max_pages.max(1),
        })
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    pub fn account_base(&self, account_domain: &str) -> Result<Url, ClientError> {
        let mut raw = match &self.base_url {
            Some(base) => base.replace("{account}", account_domain),
            None => format!("https://{account_domain}.kommo.com/"),
        };
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|source| ClientError::Url { url: raw, source })
    }

    pub fn resolve_url(&self, account_domain: &str, path: &str) -> Result<Url, ClientError> {
        self.account_base(account_domain)?
            .join(path)
            .map_err(|source| ClientError::Url {
                url: path.to_string(),
                source,
            })
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<T, ClientError> {
        let value = self.request_value(descriptor).await?;
        serde_json::from_value(value).map_err(|source| ClientError::Decode {
            path: descriptor.path.clone(),
            source,
        })
    }

    pub async fn request_value(&self, descriptor: &RequestDescriptor) -> Result<Value, ClientError> {
        let url = self.resolve_url(&descriptor.account_domain, &descriptor.path)?;
        let cache_key = descriptor.effective_cache_key();

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(key = key.as_str(), "crm response cache hit");
                return Ok(hit);
            }
            debug!(key = key.as_str(), "crm response cache miss");
        }

        let outcome = match self
            .gate
            .schedule(|| self.send_with_retry(&url, descriptor))
            .await
        {
            Ok(result) => result,
            Err(closed) => Err(ClientError::from(closed)),
        };

        match outcome {
            Ok(value) => {
                if let Some(key) = cache_key {
                    self.cache.set(key, value.clone(), descriptor.cache_ttl);
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(key) = &cache_key {
                    self.cache.delete(key);
                }
                Err(err)
            }
        }
    }

    async fn send_with_retry(
        &self,
        url: &Url,
        descriptor: &RequestDescriptor,
    ) -> Result<Value, ClientError> {
        let mut attempt: u32 = 1;
        loop {
            let span = info_span!(
                "crm_request",
                account_domain = descriptor.account_domain.as_str(),
                path = descriptor.path.as_str(),
                attempt
            );
            match self.send_once(url, descriptor).instrument(span).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    if !self.backoff.should_retry(attempt, failure.disposition) {
                        return Err(failure.error.into());
                    }
                    let delay = self.backoff.delay_after_attempt(attempt);
                    warn!(
                        status = failure.error.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        path = descriptor.path.as_str(),
                        "retrying CRM request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(
        &self,
        url: &Url,
        descriptor: &RequestDescriptor,
    ) -> Result<Value, AttemptFailure> {
        let mut builder = self
            .http
            .request(descriptor.method.clone(), url.clone())
            .header(AUTHORIZATION, descriptor.auth.authorization_header())
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = &descriptor.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| AttemptFailure {
            disposition: classify_reqwest_error(&err),
            error: CrmRequestError::transport(&err),
        })?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("json"));

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = error_detail(text, is_json);
            return Err(AttemptFailure {
                error: CrmRequestError::from_status(status, detail),
                disposition: classify_status(status),
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let text = response.text().await.map_err(|err| AttemptFailure {
            disposition: classify_reqwest_error(&err),
            error: CrmRequestError::transport(&err),
        })?;

        if !is_json {
            return Ok(Value::String(text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| AttemptFailure {
            error: CrmRequestError {
                status: status.as_u16(),
                message: format!("malformed JSON body: {err}"),
                detail: Some(Value::String(text)),
            },
            disposition: RetryDisposition::NonRetryable,
        })
    }

    /// Follows `_links.next` from `initial_path` until a 204 or a page without one.
    pub async fn fetch_all_pages<E, T, F>(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        initial_path: &str,
        extract: F,
    ) -> Result<Vec<T>, ClientError>
    where
        E: DeserializeOwned,
        F: Fn(E) -> Vec<T>,
    {
        let mut items = Vec::new();
        let mut next_path = Some(initial_path.to_string());
        let mut pages = 0usize;

        while let Some(path) = next_path.take() {
            if pages >= self.max_pages {
                return Err(ClientError::PageLimitExceeded {
                    path: initial_path.to_string(),
                    limit: self.max_pages,
                });
            }
            pages += 1;

            let descriptor = RequestDescriptor::get(account_domain, path, auth.clone());
            let page: Option<Page<E>> = self.request(&descriptor).await?;
            let Some(page) = page else {
                break;
            };

            if let Some(embedded) = page.embedded {
                items.extend(extract(embedded));
            }

            next_path = match page.links.and_then(|links| links.next) {
                Some(next) => Some(self.next_page_path(account_domain, &next.href)?),
                None => None,
            };
        }

        debug!(account_domain, path = initial_path, pages, items = items.len(), "pagination complete");
        Ok(items)
    }

    // Next links may name the CRM host directly; rebase them under the account base.
    fn next_page_path(&self, account_domain: &str, href: &str) -> Result<String, ClientError> {
        let base = self.account_base(account_domain)?;
        let url = base.join(href).map_err(|source| ClientError::Url {
            url: href.to_string(),
            source,
        })?;
        let path = url
            .path()
            .strip_prefix(base.path())
            .unwrap_or_else(|| url.path().trim_start_matches('/'));
        Ok(match url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        })
    }

    pub fn invalidate_cache(&self, prefix: &str) -> usize {
        self.cache.invalidate_prefix(prefix)
    }
}

fn error_detail(text: String, is_json: bool) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    if is_json {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return Some(parsed);
        }
    }
    Some(Value::String(text))
}

#[derive(Debug, Deserialize)]
struct PipelinesEmbedded {
    #[serde(default)]
    pipelines: Vec<WirePipeline>,
}

#[derive(Debug, Deserialize)]
struct WirePipeline {
    id: i64,
    name: String,
    #[serde(default)]
    is_main: bool,
    #[serde(rename = "_embedded", default)]
    embedded: Option<WireStatuses>,
}

#[derive(Debug, Deserialize)]
struct WireStatuses {
    #[serde(default)]
    statuses: Vec<PipelineStatus>,
}

#[derive(Debug, Deserialize)]
struct UsersEmbedded {
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: i64,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EventsEmbedded {
    #[serde(default)]
    events: Vec<StageChangeEvent>,
}

#[derive(Debug, Deserialize)]
struct LeadsEmbedded {
    #[serde(default)]
    leads: Vec<Lead>,
}

impl From<WirePipeline> for Pipeline {
    fn from(wire: WirePipeline) -> Self {
        let statuses = wire.embedded.map(|e| e.statuses).unwrap_or_default();
        Pipeline::new(wire.id, wire.name, wire.is_main, statuses)
    }
}

impl From<WireUser> for UserRef {
    fn from(wire: WireUser) -> Self {
        UserRef {
            id: wire.id,
            name: wire.name,
            email: wire.email,
            is_active: wire.is_active,
        }
    }
}

pub fn events_path(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("filter[type][]", "lead_status_changed")
        .append_pair("filter[entity][]", "lead")
        .append_pair("filter[created_at][from]", &from.timestamp().to_string())
        .append_pair("filter[created_at][to]", &to.timestamp().to_string())
        .append_pair("limit", &EVENTS_PAGE_LIMIT.to_string())
        .finish();
    format!("{EVENTS_PATH}?{query}")
}

pub fn leads_path(ids: &[i64]) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for id in ids {
        query.append_pair("filter[id][]", &id.to_string());
    }
    query.append_pair("limit", &LEADS_PAGE_LIMIT.to_string());
    format!("{LEADS_PATH}?{}", query.finish())
}

#[async_trait]
pub trait CrmDataSource: Send + Sync {
    async fn pipelines(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<Pipeline>, ClientError>;

    async fn users(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<UserRef>, ClientError>;

    async fn events_in_window(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageChangeEvent>, ClientError>;

    async fn leads_by_ids(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        ids: &[i64],
    ) -> Result<Vec<Lead>, ClientError>;
}

/// Typed accessors over [`CrmClient`] with 15 minute pipeline and user caches.
pub struct MetadataService {
    client: Arc<CrmClient>,
    pipelines: ResponseCache<Vec<Pipeline>>,
    users: ResponseCache<Vec<UserRef>>,
    lead_batch_size: usize,
}

impl MetadataService {
    pub const METADATA_TTL: Duration = Duration::from_secs(15 * 60);

    pub fn new(client: Arc<CrmClient>) -> Self {
        Self {
            client,
            pipelines: ResponseCache::new(200, Self::METADATA_TTL),
            users: ResponseCache::new(200, Self::METADATA_TTL),
            lead_batch_size: DEFAULT_LEAD_BATCH_SIZE,
        }
    }

    pub fn with_lead_batch_size(mut self, batch_size: usize) -> Self {
        self.lead_batch_size = batch_size.max(1);
        self
    }

    pub fn client(&self) -> &Arc<CrmClient> {
        &self.client
    }

    pub async fn fetch_pipelines(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<Pipeline>, ClientError> {
        let key = format!("{account_domain}:pipelines");
        if let Some(cached) = self.pipelines.get(&key) {
            return Ok(cached);
        }
        let pipelines = self
            .client
            .fetch_all_pages(account_domain, auth, PIPELINES_PATH, |e: PipelinesEmbedded| {
                e.pipelines.into_iter().map(Pipeline::from).collect()
            })
            .await?;
        self.pipelines.set(key, pipelines.clone(), None);
        Ok(pipelines)
    }

    pub async fn fetch_users(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<UserRef>, ClientError> {
        let key = format!("{account_domain}:users");
        if let Some(cached) = self.users.get(&key) {
            return Ok(cached);
        }
        let users = self
            .client
            .fetch_all_pages(account_domain, auth, USERS_PATH, |e: UsersEmbedded| {
                e.users.into_iter().map(UserRef::from).collect()
            })
            .await?;
        self.users.set(key, users.clone(), None);
        Ok(users)
    }

    pub async fn fetch_events_in_window(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageChangeEvent>, ClientError> {
        self.client
            .fetch_all_pages(account_domain, auth, &events_path(from, to), |e: EventsEmbedded| {
                e.events
            })
            .await
    }

    /// Leads for `ids`, deduplicated and fetched in batches. Any failing
    /// batch fails the whole call.
    pub async fn fetch_leads_by_ids(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        ids: &[i64],
    ) -> Result<Vec<Lead>, ClientError> {
        let mut seen = HashSet::new();
        let unique: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let mut leads = Vec::with_capacity(unique.len());
        for batch in unique.chunks(self.lead_batch_size) {
            let descriptor = RequestDescriptor::get(account_domain, leads_path(batch), auth.clone());
            let page: Option<Page<LeadsEmbedded>> = self.client.request(&descriptor).await?;
            if let Some(embedded) = page.and_then(|p| p.embedded) {
                leads.extend(embedded.leads);
            }
        }
        Ok(leads)
    }

    pub fn invalidate_account(&self, account_domain: &str) {
        self.pipelines.delete(&format!("{account_domain}:pipelines"));
        self.users.delete(&format!("{account_domain}:users"));
        self.client.invalidate_cache(&format!("{account_domain}:"));
    }
}

#[async_trait]
impl CrmDataSource for MetadataService {
    async fn pipelines(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<Pipeline>, ClientError> {
        self.fetch_pipelines(account_domain, auth).await
    }

    async fn users(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
    ) -> Result<Vec<UserRef>, ClientError> {
        self.fetch_users(account_domain, auth).await
    }

    async fn events_in_window(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StageChangeEvent>, ClientError> {
        self.fetch_events_in_window(account_domain, auth, from, to).await
    }

    async fn leads_by_ids(
        &self,
        account_domain: &str,
        auth: &AuthCredential,
        ids: &[i64],
    ) -> Result<Vec<Lead>, ClientError> {
        self.fetch_leads_by_ids(account_domain, auth, ids).await
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub id: String,
    pub user_id: String,
    pub account_domain: String,
    pub auth: AuthCredential,
    pub metadata: ConnectionMetadata,
    pub updated_at: DateTime<Utc>,
}

impl ResolvedConnection {
    pub fn timezone(&self) -> Option<&str> {
        self.metadata
            .timezone
            .as_deref()
            .filter(|tz| !tz.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAuthType {
    #[serde(rename = "oauth")]
    OAuth,
    Token,
}

/// Stored connection row; token columns hold ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub user_id: String,
    pub account_domain: String,
    pub auth_type: ConnectionAuthType,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {connection_id} has no access token")]
    MissingAccessToken { connection_id: String },
    #[error("decrypting connection secret: {0:#}")]
    Decrypt(#[source] anyhow::Error),
    #[error("loading connection: {0:#}")]
    Source(#[source] anyhow::Error),
}

#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn latest_for_user(&self, user_id: &str) -> anyhow::Result<Option<ConnectionRecord>>;
}

pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<Option<ResolvedConnection>, ConnectionError>;
}

/// Resolves connections from a [`ConnectionSource`], caching each for a minute.
pub struct StoredConnectionResolver {
    source: Arc<dyn ConnectionSource>,
    cipher: Arc<dyn SecretCipher>,
    cache: moka::sync::Cache<String, ResolvedConnection>,
}

impl StoredConnectionResolver {
    pub const CACHE_TTL: Duration = Duration::from_secs(60);

    pub fn new(source: Arc<dyn ConnectionSource>, cipher: Arc<dyn SecretCipher>) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(100)
            .time_to_live(Self::CACHE_TTL)
            .build();
        Self {
            source,
            cipher,
            cache,
        }
    }

    pub fn invalidate(&self, user_id: &str) {
        self.cache.invalidate(user_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, ConnectionError> {
        self.cipher.decrypt(ciphertext).map_err(ConnectionError::Decrypt)
    }

    fn build_auth(&self, record: &ConnectionRecord) -> Result<AuthCredential, ConnectionError> {
        match record.auth_type {
            ConnectionAuthType::OAuth => {
                let access_token = match &record.access_token_encrypted {
                    Some(ciphertext) => self.decrypt(ciphertext)?,
                    None => String::new(),
                };
                let refresh_token = record
                    .refresh_token_encrypted
                    .as_deref()
                    .map(|ciphertext| self.decrypt(ciphertext))
                    .transpose()?;
                Ok(AuthCredential::OAuth {
                    access_token,
                    refresh_token,
                    expires_at: record.expires_at,
                })
            }
            ConnectionAuthType::Token => {
                let ciphertext = record.access_token_encrypted.as_deref().ok_or_else(|| {
                    ConnectionError::MissingAccessToken {
                        connection_id: record.id.clone(),
                    }
                })?;
                Ok(AuthCredential::bearer(self.decrypt(ciphertext)?))
            }
        }
    }
}

#[async_trait]
impl CredentialResolver for StoredConnectionResolver {
    async fn resolve(&self, user_id: &str) -> Result<Option<ResolvedConnection>, ConnectionError> {
        if let Some(cached) = self.cache.get(user_id) {
            return Ok(Some(cached));
        }

        let Some(record) = self
            .source
            .latest_for_user(user_id)
            .await
            .map_err(ConnectionError::Source)?
        else {
            return Ok(None);
        };

        let connection = ResolvedConnection {
            auth: self.build_auth(&record)?,
            id: record.id,
            user_id: record.user_id,
            account_domain: record.account_domain,
            metadata: record.metadata,
            updated_at: record.updated_at,
        };
        self.cache.insert(user_id.to_string(), connection.clone());
        Ok(Some(connection))
    }
}

#[derive(Debug, Clone)]
pub struct StaticCredentialResolver {
    connection: ResolvedConnection,
}

impl StaticCredentialResolver {
    pub fn new(
        account_domain: impl Into<String>,
        auth: AuthCredential,
        timezone: Option<String>,
    ) -> Self {
        Self {
            connection: ResolvedConnection {
                id: "static".to_string(),
                user_id: String::new(),
                account_domain: account_domain.into(),
                auth,
                metadata: ConnectionMetadata {
                    timezone,
                    method: Some("token".to_string()),
                    ..ConnectionMetadata::default()
                },
                updated_at: Utc::now(),
            },
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, user_id: &str) -> Result<Option<ResolvedConnection>, ConnectionError> {
        let mut connection = self.connection.clone();
        connection.user_id = user_id.to_string();
        Ok(Some(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ACCOUNT: &str = "acme";

    fn test_config(server: &MockServer) -> CrmClientConfig {
        CrmClientConfig {
            base_url: Some(server.uri()),
            timeout: Duration::from_secs(5),
            gate: GateConfig {
                max_concurrent: 1,
                min_interval: Duration::ZERO,
            },
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
            },
            ..CrmClientConfig::default()
        }
    }

    fn client_for(server: &MockServer) -> CrmClient {
        CrmClient::new(test_config(server)).expect("client")
    }

    fn auth() -> AuthCredential {
        AuthCredential::bearer("secret-token")
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        Mock::given(method("GET"))
            .and(path("/api/v4/account"))
            .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
                let current = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    ResponseTemplate::new(500)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 7 }))
                }
            })
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let value: Value = client
            .request(&RequestDescriptor::get(ACCOUNT, "api/v4/account", auth()))
            .await
            .expect("third attempt succeeds");

        assert_eq!(value["id"], 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors_and_keeps_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({ "title": "Not found" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/leads/1", auth()))
            .await
            .expect_err("404 fails");

        let crm = err.crm().expect("crm error");
        assert_eq!(crm.status, 404);
        assert_eq!(crm.kind(), CrmErrorKind::Client);
        assert_eq!(crm.detail.as_ref().unwrap()["title"], "Not found");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auth_failures_are_flagged_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/users", auth()))
            .await
            .expect_err("401 fails");

        assert!(err.is_auth_error());
        assert!(!err.is_rate_limit_error());
        assert_eq!(
            err.crm().unwrap().detail,
            Some(Value::String("token expired".to_string()))
        );
    }

    #[tokio::test]
    async fn rate_limits_are_retried_then_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/events", auth()))
            .await
            .expect_err("429 exhausts retries");

        assert!(err.is_rate_limit_error());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn transport_failures_report_status_zero() {
        let client = CrmClient::new(CrmClientConfig {
            base_url: Some("http://127.0.0.1:9/".to_string()),
            timeout: Duration::from_millis(500),
            gate: GateConfig {
                max_concurrent: 1,
                min_interval: Duration::ZERO,
            },
            backoff: BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..CrmClientConfig::default()
        })
        .expect("client");

        let err = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/users", auth()))
            .await
            .expect_err("nothing listens on the discard port");
        assert_eq!(err.crm().unwrap().kind(), CrmErrorKind::Transport);
        assert_eq!(err.crm().unwrap().status, 0);
    }

    #[tokio::test]
    async fn timed_out_requests_are_retried_as_transport_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.timeout = Duration::from_millis(50);
        let client = CrmClient::new(config).unwrap();
        let err = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/users", auth()))
            .await
            .expect_err("every attempt times out");

        assert_eq!(err.crm().unwrap().status, 0);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn request_timeout_status_is_retried() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        Mock::given(method("GET"))
            .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
                if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(408)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 1 }))
                }
            })
            .mount(&server)
            .await;

        let client = client_for(&server);
        let value = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/account", auth()))
            .await
            .unwrap();

        assert_eq!(value["id"], 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sends_bearer_header_and_parses_text_and_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/ping"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let text = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/ping", auth()))
            .await
            .unwrap();
        let empty = client
            .request_value(&RequestDescriptor::get(ACCOUNT, "api/v4/empty", auth()))
            .await
            .unwrap();

        assert_eq!(text, Value::String("pong".to_string()));
        assert_eq!(empty, Value::Null);
    }

    #[tokio::test]
    async fn cached_get_is_served_without_second_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "n": 1 })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let descriptor = RequestDescriptor::get(ACCOUNT, "api/v4/account", auth());
        let first = client.request_value(&descriptor).await.unwrap();
        let second = client.request_value(&descriptor).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        assert_eq!(client.invalidate_cache("acme:"), 1);
        assert_eq!(client.invalidate_cache("acme:"), 0);
    }

    #[tokio::test]
    async fn failed_calls_do_not_populate_the_cache() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        Mock::given(method("GET"))
            .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
                if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(400)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true }))
                }
            })
            .mount(&server)
            .await;

        let client = client_for(&server);
        let descriptor = RequestDescriptor::get(ACCOUNT, "api/v4/account", auth());
        assert!(client.request_value(&descriptor).await.is_err());
        let value = client.request_value(&descriptor).await.unwrap();

        assert_eq!(value["ok"], true);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pagination_follows_next_links_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [{ "id": 3, "name": "Caio" }] },
                "_links": {}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param_is_missing("page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [
                    { "id": 1, "name": "Ana", "email": "ana@example.com" },
                    { "id": 2, "name": "Bia", "is_active": false }
                ] },
                "_links": { "next": { "href": format!("{}/api/v4/users?limit=200&page=2", server.uri()) } }
            })))
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server)));
        let users = service.fetch_users(ACCOUNT, &auth()).await.unwrap();

        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(users[0].email.as_deref(), Some("ana@example.com"));
        assert_eq!(users[1].is_active, Some(false));

        service.fetch_users(ACCOUNT, &auth()).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn next_links_keep_the_base_url_path_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxy/acme/api/v4/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [{ "id": 2, "name": "Bia" }] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxy/acme/api/v4/users"))
            .and(query_param_is_missing("page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [{ "id": 1, "name": "Ana" }] },
                "_links": { "next": { "href": "https://acme.kommo.com/api/v4/users?limit=200&page=2" } }
            })))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.base_url = Some(format!("{}/proxy/{{account}}/", server.uri()));
        let client = CrmClient::new(config).unwrap();
        let users = client
            .fetch_all_pages(ACCOUNT, &auth(), USERS_PATH, |e: UsersEmbedded| e.users)
            .await
            .unwrap();

        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_page_with_next_link_keeps_paginating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [{ "id": 9, "name": "Duda" }] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param_is_missing("page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "users": [] },
                "_links": { "next": { "href": "/api/v4/users?limit=200&page=2" } }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let users = client
            .fetch_all_pages(ACCOUNT, &auth(), USERS_PATH, |e: UsersEmbedded| e.users)
            .await
            .unwrap();

        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, 9);
    }

    #[tokio::test]
    async fn no_content_ends_pagination_with_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/events"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server)));
        let from = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let to = DateTime::from_timestamp(1_700_086_399, 0).unwrap();
        let events = service
            .fetch_events_in_window(ACCOUNT, &auth(), from, to)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn runaway_pagination_hits_the_page_limit() {
        let server = MockServer::start().await;
        let uri = server.uri();
        Mock::given(method("GET"))
            .respond_with(move |req: &wiremock::Request| -> ResponseTemplate {
                let page: u32 = req
                    .url
                    .query_pairs()
                    .find(|(k, _)| k == "page")
                    .and_then(|(_, v)| v.parse().ok())
                    .unwrap_or(1);
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "_embedded": { "users": [{ "id": page, "name": "loop" }] },
                    "_links": { "next": { "href": format!("{uri}/api/v4/users?page={}", page + 1) } }
                }))
            })
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.max_pages = 3;
        let client = CrmClient::new(config).unwrap();
        let err = client
            .fetch_all_pages(ACCOUNT, &auth(), USERS_PATH, |e: UsersEmbedded| e.users)
            .await
            .expect_err("never terminates on its own");

        assert!(matches!(err, ClientError::PageLimitExceeded { limit: 3, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn event_window_query_carries_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/events"))
            .and(query_param("filter[type][]", "lead_status_changed"))
            .and(query_param("filter[entity][]", "lead"))
            .and(query_param("filter[created_at][from]", "1700000000"))
            .and(query_param("filter[created_at][to]", "1700086399"))
            .and(query_param("limit", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "events": [{
                    "id": "01abc",
                    "type": "lead_status_changed",
                    "entity_id": 11,
                    "created_at": 1_700_000_100,
                    "value_after": { "pipeline_id": 1, "status_id": 142 }
                }] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server)));
        let from = DateTime::from_timestamp_millis(1_700_000_000_900).unwrap();
        let to = DateTime::from_timestamp_millis(1_700_086_399_999).unwrap();
        let events = service
            .fetch_events_in_window(ACCOUNT, &auth(), from, to)
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, 11);
        assert_eq!(events[0].value_after.unwrap().status_id, Some(142));
    }

    #[tokio::test]
    async fn leads_are_deduplicated_and_batched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/leads"))
            .respond_with(|req: &wiremock::Request| -> ResponseTemplate {
                let leads: Vec<Value> = req
                    .url
                    .query_pairs()
                    .filter(|(k, _)| k == "filter[id][]")
                    .map(|(_, v)| {
                        let id: i64 = v.parse().unwrap();
                        serde_json::json!({ "id": id, "price": id * 10 })
                    })
                    .collect();
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "_embedded": { "leads": leads }
                }))
            })
            .expect(2)
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server))).with_lead_batch_size(2);
        let leads = service
            .fetch_leads_by_ids(ACCOUNT, &auth(), &[5, 6, 5, 7, 6])
            .await
            .unwrap();

        let ids: Vec<i64> = leads.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert_eq!(leads[2].price, 70.0);
    }

    #[tokio::test]
    async fn one_failing_lead_batch_fails_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/leads"))
            .and(query_param("filter[id][]", "9"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/leads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "leads": [{ "id": 1, "price": 5 }] }
            })))
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server))).with_lead_batch_size(1);
        let err = service
            .fetch_leads_by_ids(ACCOUNT, &auth(), &[1, 9])
            .await
            .expect_err("second batch fails");
        assert_eq!(err.crm().unwrap().status, 400);
    }

    #[tokio::test]
    async fn pipelines_map_statuses_and_are_cached_per_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/leads/pipelines"))
            .and(query_param("with", "statuses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_embedded": { "pipelines": [{
                    "id": 10,
                    "name": "Sales",
                    "is_main": true,
                    "_embedded": { "statuses": [
                        { "id": 100, "name": "New", "sort": 10, "type": 0 },
                        { "id": 142, "name": "Won", "sort": 10000, "type": 1 },
                        { "id": 143, "name": "Lost", "sort": 11000, "type": 2 }
                    ] }
                }] }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let service = MetadataService::new(Arc::new(client_for(&server)));
        let pipelines = service.fetch_pipelines(ACCOUNT, &auth()).await.unwrap();
        assert_eq!(pipelines.len(), 1);
        assert!(pipelines[0].is_main);
        assert_eq!(pipelines[0].won_status_ids, vec![142]);
        assert_eq!(pipelines[0].lost_status_ids, vec![143]);

        service.fetch_pipelines(ACCOUNT, &auth()).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        service.invalidate_account(ACCOUNT);
        service.fetch_pipelines(ACCOUNT, &auth()).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn cache_key_defaults_to_account_and_path_for_plain_gets() {
        let get = RequestDescriptor::get(ACCOUNT, "api/v4/users", auth());
        assert_eq!(get.effective_cache_key().as_deref(), Some("acme:api/v4/users"));

        let post = RequestDescriptor::get(ACCOUNT, "api/v4/leads", auth())
            .with_body(Method::POST, serde_json::json!([{ "name": "x" }]));
        assert_eq!(post.effective_cache_key(), None);

        let explicit = post.with_cache_key("custom");
        assert_eq!(explicit.effective_cache_key().as_deref(), Some("custom"));
    }

    #[test]
    fn error_kinds_follow_status_codes() {
        let kind = |status: u16| CrmRequestError {
            status,
            message: String::new(),
            detail: None,
        }
        .kind();
        assert_eq!(kind(0), CrmErrorKind::Transport);
        assert_eq!(kind(403), CrmErrorKind::Auth);
        assert_eq!(kind(429), CrmErrorKind::RateLimited);
        assert_eq!(kind(422), CrmErrorKind::Client);
        assert_eq!(kind(503), CrmErrorKind::Server);
    }

    #[test]
    fn default_base_url_targets_the_account_subdomain() {
        let client = CrmClient::new(CrmClientConfig::default()).unwrap();
        let url = client.resolve_url("acme", "api/v4/users?limit=200").unwrap();
        assert_eq!(url.as_str(), "https://acme.kommo.com/api/v4/users?limit=200");
    }

    struct FakeSource {
        record: Option<ConnectionRecord>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionSource for FakeSource {
        async fn latest_for_user(&self, _user_id: &str) -> anyhow::Result<Option<ConnectionRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.record.clone())
        }
    }

    struct PrefixCipher;

    impl SecretCipher for PrefixCipher {
        fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
            ciphertext
                .strip_prefix("enc:")
                .map(ToString::to_string)
                .ok_or_else(|| anyhow::anyhow!("not encrypted"))
        }
    }

    fn record(auth_type: ConnectionAuthType, access: Option<&str>) -> ConnectionRecord {
        ConnectionRecord {
            id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            account_domain: ACCOUNT.to_string(),
            auth_type,
            access_token_encrypted: access.map(ToString::to_string),
            refresh_token_encrypted: Some("enc:refresh".to_string()),
            expires_at: None,
            metadata: ConnectionMetadata {
                timezone: Some("America/Sao_Paulo".to_string()),
                ..ConnectionMetadata::default()
            },
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stored_resolver_decrypts_and_caches_connections() {
        let source = Arc::new(FakeSource {
            record: Some(record(ConnectionAuthType::OAuth, Some("enc:access"))),
            calls: AtomicUsize::new(0),
        });
        let resolver = StoredConnectionResolver::new(source.clone(), Arc::new(PrefixCipher));

        let connection = resolver.resolve("user-1").await.unwrap().unwrap();
        assert_eq!(connection.auth.authorization_header(), "Bearer access");
        assert_eq!(connection.timezone(), Some("America/Sao_Paulo"));
        match &connection.auth {
            AuthCredential::OAuth { refresh_token, .. } => {
                assert_eq!(refresh_token.as_deref(), Some("refresh"))
            }
            other => panic!("expected oauth, got {other:?}"),
        }

        resolver.resolve("user-1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        resolver.invalidate("user-1");
        resolver.resolve("user-1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_connections_require_an_access_token() {
        let source = Arc::new(FakeSource {
            record: Some(record(ConnectionAuthType::Token, None)),
            calls: AtomicUsize::new(0),
        });
        let resolver = StoredConnectionResolver::new(source, Arc::new(PrefixCipher));
        let err = resolver.resolve("user-1").await.expect_err("missing token");
        assert!(matches!(err, ConnectionError::MissingAccessToken { .. }));
    }

    #[tokio::test]
    async fn missing_connection_resolves_to_none() {
        let source = Arc::new(FakeSource {
            record: None,
            calls: AtomicUsize::new(0),
        });
        let resolver = StoredConnectionResolver::new(source, Arc::new(PrefixCipher));
        assert!(resolver.resolve("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn static_resolver_serves_every_user() {
        let resolver = StaticCredentialResolver::new(ACCOUNT, auth(), None);
        let a = resolver.resolve("a").await.unwrap().unwrap();
        let b = resolver.resolve("b").await.unwrap().unwrap();
        assert_eq!(a.account_domain, b.account_domain);
        assert_eq!(b.user_id, "b");
        assert_eq!(a.timezone(), None);
    }
}
