//! Revenue metric for kpulse: window and filter resolution, the aggregation
//! itself, and the cache-aware orchestration around it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use kpulse_client::{
    ClientError, ConnectionError, ConnectionMetadata, CrmClient, CrmClientConfig, CrmDataSource,
    CredentialResolver, MetadataService, ResolvedConnection, StaticCredentialResolver,
};
use kpulse_core::{
    sorted_unique, AuthCredential, Lead, Pipeline, PipelineStatus, RevenueFilters, RevenueResult,
    RevenueSeriesPoint, StageChangeEvent, TimeWindow, UserRef, ValidationError,
};
use kpulse_storage::{
    BackoffPolicy, CacheDecision, FileMetricsStore, GateConfig, MetricsCache, MetricsCacheConfig,
    MetricsStore, PgMetricsStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kpulse-metrics";

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_CURRENCY: &str = "BRL";

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub database_url: Option<String>,
    pub cache_dir: PathBuf,
    pub account_domain: Option<String>,
    pub api_token: Option<String>,
    pub default_timezone: String,
    pub currency: String,
    pub crm_base_url: Option<String>,
    pub gate_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub metrics_ttl_secs: u64,
    pub force_cooldown_secs: u64,
    pub user_agent: String,
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("DATABASE_URL"),
            cache_dir: std::env::var("KPULSE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.kpulse-cache")),
            account_domain: non_empty_env("KPULSE_ACCOUNT_DOMAIN"),
            api_token: non_empty_env("KPULSE_API_TOKEN"),
            default_timezone: std::env::var("KPULSE_TIMEZONE")
                .unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string()),
            currency: std::env::var("KPULSE_CURRENCY")
                .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string()),
            crm_base_url: non_empty_env("KPULSE_CRM_BASE_URL"),
            gate_interval_ms: parsed_env("KPULSE_GATE_INTERVAL_MS").unwrap_or(400),
            http_timeout_secs: parsed_env("KPULSE_HTTP_TIMEOUT_SECS").unwrap_or(20),
            max_pages: parsed_env("KPULSE_MAX_PAGES").unwrap_or(500),
            metrics_ttl_secs: parsed_env("KPULSE_METRICS_TTL_SECS").unwrap_or(300),
            force_cooldown_secs: parsed_env("KPULSE_FORCE_COOLDOWN_SECS").unwrap_or(120),
            user_agent: std::env::var("KPULSE_USER_AGENT")
                .unwrap_or_else(|_| "kpulse/0.1".to_string()),
        }
    }

    pub fn client_config(&self) -> CrmClientConfig {
        CrmClientConfig {
            base_url: self.crm_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            gate: GateConfig {
                max_concurrent: 1,
                min_interval: Duration::from_millis(self.gate_interval_ms),
            },
            backoff: BackoffPolicy::default(),
            max_pages: self.max_pages,
            ..CrmClientConfig::default()
        }
    }

    pub fn cache_config(&self) -> MetricsCacheConfig {
        MetricsCacheConfig {
            ttl: Duration::from_secs(self.metrics_ttl_secs),
            force_cooldown: Duration::from_secs(self.force_cooldown_secs),
        }
    }

    pub async fn open_store(&self) -> anyhow::Result<Arc<dyn MetricsStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgMetricsStore::connect(url).await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(FileMetricsStore::new(self.cache_dir.clone()))),
        }
    }

    pub fn static_resolver(&self) -> anyhow::Result<StaticCredentialResolver> {
        let account_domain = self
            .account_domain
            .clone()
            .context("KPULSE_ACCOUNT_DOMAIN is not set")?;
        let token = self.api_token.clone().context("KPULSE_API_TOKEN is not set")?;
        Ok(StaticCredentialResolver::new(
            account_domain,
            AuthCredential::bearer(token),
            Some(self.default_timezone.clone()),
        ))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangePreset {
    Today,
    Last7Days,
    Last30Days,
    Quarter,
    Custom,
}

impl RangePreset {
    /// Absent or blank input means the 30 day default.
    pub fn parse(raw: Option<&str>) -> Result<Self, ValidationError> {
        match raw.map(str::trim).filter(|v| !v.is_empty()) {
            None | Some("30d") => Ok(Self::Last30Days),
            Some("today") => Ok(Self::Today),
            Some("7d") => Ok(Self::Last7Days),
            Some("quarter") => Ok(Self::Quarter),
            Some("custom") => Ok(Self::Custom),
            Some(other) => Err(ValidationError::UnknownRange(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Last7Days => "7d",
            Self::Last30Days => "30d",
            Self::Quarter => "quarter",
            Self::Custom => "custom",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Last7Days => "Last 7 days",
            Self::Last30Days => "Last 30 days",
            Self::Quarter => "Last 90 days",
            Self::Custom => "Custom",
        }
    }

    fn span_days(self) -> u64 {
        match self {
            Self::Today | Self::Custom => 1,
            Self::Last7Days => 7,
            Self::Last30Days => 30,
            Self::Quarter => 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRange {
    pub preset: RangePreset,
    pub label: String,
    pub window: TimeWindow,
}

/// Turns a preset (or a custom date pair) into local-day-aligned windows.
pub fn resolve_range(
    preset: RangePreset,
    tz: Tz,
    from: Option<&str>,
    to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ResolvedRange, ValidationError> {
    let (start_date, end_date) = match preset {
        RangePreset::Custom => {
            let (Some(from), Some(to)) = (from, to) else {
                return Err(ValidationError::InvalidCustomRange(
                    "both `from` and `to` are required".to_string(),
                ));
            };
            let start = parse_local_date(from, tz)?;
            let end = parse_local_date(to, tz)?;
            if start > end {
                return Err(ValidationError::InvalidCustomRange(format!(
                    "`from` {start} is after `to` {end}"
                )));
            }
            (start, end)
        }
        other => {
            let today = now.with_timezone(&tz).date_naive();
            let start = today
                .checked_sub_days(Days::new(other.span_days() - 1))
                .ok_or_else(|| ValidationError::InvalidCustomRange(today.to_string()))?;
            (start, today)
        }
    };

    let current_from = start_of_local_day(start_date, tz)?;
    let current_to = end_of_local_day(end_date, tz)?;
    Ok(ResolvedRange {
        preset,
        label: preset.label().to_string(),
        window: TimeWindow::preceding(current_from, current_to)?,
    })
}

fn parse_local_date(raw: &str, tz: Tz) -> Result<NaiveDate, ValidationError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&tz).date_naive())
        .map_err(|_| ValidationError::InvalidCustomRange(format!("unparseable date `{raw}`")))
}

// DST gaps at midnight push the start forward to the first existing hour.
fn start_of_local_day(date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>, ValidationError> {
    (0..24)
        .find_map(|hour| {
            let naive = date.and_hms_opt(hour, 0, 0)?;
            tz.from_local_datetime(&naive).earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::InvalidCustomRange(date.to_string()))
}

fn end_of_local_day(date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>, ValidationError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| ValidationError::InvalidCustomRange(date.to_string()))?;
    Ok(start_of_local_day(next, tz)? - chrono::Duration::milliseconds(1))
}

pub fn parse_id_list(dimension: &str, raw: Option<&str>) -> Result<Vec<i64>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<i64>().map_err(|_| ValidationError::InvalidId {
                dimension: dimension.to_string(),
                value: token.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSelector {
    All,
    Won,
    Lost,
    Ids(Vec<i64>),
}

impl StageSelector {
    pub fn parse(raw: Option<&str>) -> Result<Self, ValidationError> {
        match raw.map(str::trim).filter(|v| !v.is_empty()) {
            None | Some("all") => Ok(Self::All),
            Some("won") => Ok(Self::Won),
            Some("lost") => Ok(Self::Lost),
            Some(list) => {
                let ids = parse_id_list("stage", Some(list))?;
                if ids.is_empty() {
                    Ok(Self::All)
                } else {
                    Ok(Self::Ids(ids))
                }
            }
        }
    }

    pub fn needs_pipelines(&self) -> bool {
        !matches!(self, Self::All)
    }
}

fn statuses_in_scope<'a>(
    pipeline_ids: &'a [i64],
    pipelines: &'a [Pipeline],
) -> impl Iterator<Item = &'a PipelineStatus> + 'a {
    pipelines
        .iter()
        .filter(move |p| pipeline_ids.is_empty() || pipeline_ids.contains(&p.id))
        .flat_map(|p| p.statuses.iter())
}

pub fn resolve_status_ids(
    selector: &StageSelector,
    pipeline_ids: &[i64],
    pipelines: &[Pipeline],
) -> Vec<i64> {
    match selector {
        StageSelector::All => Vec::new(),
        StageSelector::Won => statuses_in_scope(pipeline_ids, pipelines)
            .filter(|s| s.is_won())
            .map(|s| s.id)
            .collect(),
        StageSelector::Lost => statuses_in_scope(pipeline_ids, pipelines)
            .filter(|s| s.is_lost())
            .map(|s| s.id)
            .collect(),
        StageSelector::Ids(ids) => {
            let known: HashSet<i64> = statuses_in_scope(pipeline_ids, pipelines)
                .map(|s| s.id)
                .collect();
            ids.iter().copied().filter(|id| known.contains(id)).collect()
        }
    }
}

pub fn stage_label(selector: &StageSelector, status_ids: &[i64], pipelines: &[Pipeline]) -> String {
    match selector {
        StageSelector::All => "All stages".to_string(),
        StageSelector::Won => "Closed won".to_string(),
        StageSelector::Lost => "Closed lost".to_string(),
        StageSelector::Ids(_) => {
            let names: Vec<&str> = status_ids
                .iter()
                .filter_map(|id| {
                    pipelines
                        .iter()
                        .find_map(|p| p.status(*id))
                        .map(|s| s.name.as_str())
                })
                .collect();
            if names.is_empty() {
                "Selected stages".to_string()
            } else {
                names.join(", ")
            }
        }
    }
}

fn id_fragment(ids: &[i64]) -> Option<String> {
    let ids = sorted_unique(ids);
    (!ids.is_empty()).then(|| {
        ids.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("-")
    })
}

/// `revenue:{tz}:{fromMs}-{toMs}:{pipelines}:{users}:{statuses}` with ids sorted.
pub fn revenue_cache_key(
    timezone: &str,
    window: &TimeWindow,
    filters: &RevenueFilters,
    stage_raw: &str,
) -> String {
    format!(
        "revenue:{timezone}:{}-{}:{}:{}:{}",
        window.current_from.timestamp_millis(),
        window.current_to.timestamp_millis(),
        id_fragment(&filters.pipeline_ids).unwrap_or_else(|| "all".to_string()),
        id_fragment(&filters.user_ids).unwrap_or_else(|| "all".to_string()),
        id_fragment(&filters.status_ids).unwrap_or_else(|| stage_raw.to_string()),
    )
}

pub fn event_matches_filters(
    event: &StageChangeEvent,
    lead: Option<&Lead>,
    filters: &RevenueFilters,
) -> bool {
    let after = event.value_after.unwrap_or_default();
    filters.admits(
        after.pipeline_id.or_else(|| lead.and_then(|l| l.pipeline_id)),
        after.status_id.or_else(|| lead.and_then(|l| l.status_id)),
        after
            .responsible_user_id
            .or_else(|| lead.and_then(|l| l.responsible_user_id)),
    )
}

pub fn trend_percentage(total: f64, previous_total: f64) -> Option<f64> {
    if previous_total == 0.0 {
        None
    } else {
        Some((total - previous_total) / previous_total * 100.0)
    }
}

#[derive(Debug, Default)]
struct WindowSummary {
    total: f64,
    unique_leads: usize,
    buckets: BTreeMap<NaiveDate, f64>,
}

fn summarize<'a>(
    events: impl Iterator<Item = &'a StageChangeEvent>,
    leads: &HashMap<i64, &Lead>,
    filters: &RevenueFilters,
    tz: Tz,
) -> WindowSummary {
    let mut qualifying: Vec<&StageChangeEvent> = events
        .filter(|e| event_matches_filters(e, leads.get(&e.entity_id).copied(), filters))
        .collect();
    qualifying.sort_by_key(|e| e.created_at);

    let mut summary = WindowSummary::default();
    let mut counted = HashSet::new();
    for event in qualifying {
        if !counted.insert(event.entity_id) {
            continue;
        }
        let price = leads.get(&event.entity_id).map_or(0.0, |l| l.price);
        summary.total += price;
        summary.unique_leads += 1;
        if let Some(local) = DateTime::from_timestamp_millis(event.created_at_ms()) {
            let day = local.with_timezone(&tz).date_naive();
            *summary.buckets.entry(day).or_insert(0.0) += price;
        }
    }
    summary
}

fn build_series(
    buckets: &BTreeMap<NaiveDate, f64>,
    window: &TimeWindow,
    tz: Tz,
) -> Vec<RevenueSeriesPoint> {
    let end = window.current_to.with_timezone(&tz).date_naive();
    let mut cursor = window.current_from.with_timezone(&tz).date_naive();
    let mut series = Vec::new();
    while cursor <= end {
        series.push(RevenueSeriesPoint {
            date: cursor.format("%Y-%m-%d").to_string(),
            value: buckets.get(&cursor).copied().unwrap_or(0.0),
        });
        match cursor.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    series
}

pub fn compute_revenue_metric(
    events: &[StageChangeEvent],
    leads: &[Lead],
    window: &TimeWindow,
    filters: &RevenueFilters,
    tz: Tz,
) -> RevenueResult {
    compute_revenue_metric_at(events, leads, window, filters, tz, Utc::now())
}

/// Revenue over `window` from stage-change events joined to their leads.
pub fn compute_revenue_metric_at(
    events: &[StageChangeEvent],
    leads: &[Lead],
    window: &TimeWindow,
    filters: &RevenueFilters,
    tz: Tz,
    generated_at: DateTime<Utc>,
) -> RevenueResult {
    let lead_map: HashMap<i64, &Lead> = leads.iter().map(|lead| (lead.id, lead)).collect();

    let current = summarize(
        events
            .iter()
            .filter(|e| window.current_contains_ms(e.created_at_ms())),
        &lead_map,
        filters,
        tz,
    );
    let previous = summarize(
        events
            .iter()
            .filter(|e| window.previous_contains_ms(e.created_at_ms())),
        &lead_map,
        filters,
        tz,
    );

    RevenueResult {
        total: current.total,
        previous_total: previous.total,
        trend_percentage: trend_percentage(current.total, previous.total),
        series: build_series(&current.buckets, window, tz),
        unique_leads: current.unique_leads,
        previous_unique_leads: previous.unique_leads,
        generated_at,
        range: *window,
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no CRM connection configured for user {user_id}")]
    ConnectionNotFound { user_id: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Crm(#[from] ClientError),
    #[error("metrics cache: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("encoding revenue payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevenueQuery {
    pub range: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub pipelines: Option<String>,
    pub users: Option<String>,
    pub stage: Option<String>,
    pub force: Option<String>,
}

impl RevenueQuery {
    pub fn force_requested(&self) -> bool {
        matches!(self.force.as_deref().map(str::trim), Some("1" | "true"))
    }
}

#[derive(Debug, Clone)]
pub struct RevenueRequest {
    pub timezone: String,
    pub range: ResolvedRange,
    pub filters: RevenueFilters,
    pub stage_label: String,
    pub stage_raw: String,
    pub force: bool,
}

impl RevenueRequest {
    pub fn cache_key(&self) -> String {
        revenue_cache_key(
            &self.timezone,
            &self.range.window,
            &self.filters,
            &self.stage_raw,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_ids: Vec<i64>,
    pub stage_label: String,
    pub stage_raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeContext {
    pub label: String,
    pub current_from: DateTime<Utc>,
    pub current_to: DateTime<Utc>,
    pub previous_from: DateTime<Utc>,
    pub previous_to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueContext {
    pub timezone: String,
    pub currency: String,
    pub filters: FilterContext,
    pub range: RangeContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub hit: bool,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub force_applied: bool,
    pub cooldown_remaining_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueResponse {
    pub data: RevenueResult,
    pub context: RevenueContext,
    pub cache: CacheStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOption {
    pub id: i64,
    pub name: String,
    pub sort: i64,
    #[serde(rename = "type")]
    pub type_code: Option<i64>,
    pub is_won: bool,
    pub is_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOption {
    pub id: i64,
    pub name: String,
    pub is_main: bool,
    pub statuses: Vec<StatusOption>,
    pub won_status_ids: Vec<i64>,
    pub lost_status_ids: Vec<i64>,
}

impl From<&Pipeline> for PipelineOption {
    fn from(pipeline: &Pipeline) -> Self {
        Self {
            id: pipeline.id,
            name: pipeline.name.clone(),
            is_main: pipeline.is_main,
            statuses: pipeline
                .statuses
                .iter()
                .map(|s| StatusOption {
                    id: s.id,
                    name: s.name.clone(),
                    sort: s.sort,
                    type_code: s.type_code,
                    is_won: pipeline.won_status_ids.contains(&s.id),
                    is_lost: pipeline.lost_status_ids.contains(&s.id),
                })
                .collect(),
            won_status_ids: pipeline.won_status_ids.clone(),
            lost_status_ids: pipeline.lost_status_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmOptions {
    pub timezone: String,
    pub account_domain: String,
    pub pipelines: Vec<PipelineOption>,
    pub users: Vec<UserRef>,
    pub metadata: ConnectionMetadata,
    pub updated_at: DateTime<Utc>,
}

pub struct RevenueOrchestrator {
    resolver: Arc<dyn CredentialResolver>,
    source: Arc<dyn CrmDataSource>,
    cache: MetricsCache,
    default_timezone: String,
    currency: String,
}

impl RevenueOrchestrator {
    pub fn new(
        resolver: Arc<dyn CredentialResolver>,
        source: Arc<dyn CrmDataSource>,
        cache: MetricsCache,
    ) -> Self {
        Self {
            resolver,
            source,
            cache,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_default_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.default_timezone = timezone.into();
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub async fn connection_for(&self, user_id: &str) -> Result<ResolvedConnection, MetricsError> {
        self.resolver
            .resolve(user_id)
            .await?
            .ok_or_else(|| MetricsError::ConnectionNotFound {
                user_id: user_id.to_string(),
            })
    }

    fn timezone_for(&self, connection: &ResolvedConnection) -> Result<(String, Tz), MetricsError> {
        if let Some(name) = connection.timezone() {
            match parse_timezone(name) {
                Ok(tz) => return Ok((name.to_string(), tz)),
                Err(_) => warn!(
                    connection_id = connection.id.as_str(),
                    timezone = name,
                    "connection timezone is not recognised; using default"
                ),
            }
        }
        let tz = parse_timezone(&self.default_timezone)?;
        Ok((self.default_timezone.clone(), tz))
    }

    pub async fn build_request(
        &self,
        connection: &ResolvedConnection,
        query: &RevenueQuery,
        now: DateTime<Utc>,
    ) -> Result<RevenueRequest, MetricsError> {
        let (timezone, tz) = self.timezone_for(connection)?;
        let preset = RangePreset::parse(query.range.as_deref())?;
        let range = resolve_range(preset, tz, query.from.as_deref(), query.to.as_deref(), now)?;
        let pipeline_ids = sorted_unique(&parse_id_list("pipelines", query.pipelines.as_deref())?);
        let user_ids = sorted_unique(&parse_id_list("users", query.users.as_deref())?);
        let selector = StageSelector::parse(query.stage.as_deref())?;
        let stage_raw = query
            .stage
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("all")
            .to_string();

        let pipelines = if selector.needs_pipelines() {
            self.source
                .pipelines(&connection.account_domain, &connection.auth)
                .await?
        } else {
            Vec::new()
        };
        let status_ids = sorted_unique(&resolve_status_ids(&selector, &pipeline_ids, &pipelines));
        let stage_label = stage_label(&selector, &status_ids, &pipelines);

        Ok(RevenueRequest {
            timezone,
            range,
            filters: RevenueFilters {
                pipeline_ids,
                user_ids,
                status_ids,
            },
            stage_label,
            stage_raw,
            force: query.force_requested(),
        })
    }

    pub async fn handle_query(
        &self,
        user_id: &str,
        query: &RevenueQuery,
    ) -> Result<RevenueResponse, MetricsError> {
        let connection = self.connection_for(user_id).await?;
        let request = self.build_request(&connection, query, Utc::now()).await?;
        self.get_revenue(user_id, &connection, &request).await
    }

    pub async fn get_revenue(
        &self,
        user_id: &str,
        connection: &ResolvedConnection,
        request: &RevenueRequest,
    ) -> Result<RevenueResponse, MetricsError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("revenue_metric", %request_id, user_id);
        self.get_revenue_inner(user_id, connection, request)
            .instrument(span)
            .await
    }

    async fn get_revenue_inner(
        &self,
        user_id: &str,
        connection: &ResolvedConnection,
        request: &RevenueRequest,
    ) -> Result<RevenueResponse, MetricsError> {
        let cache_key = request.cache_key();
        let connection_id = Some(connection.id.as_str());

        let cached = self
            .cache
            .read(user_id, &cache_key, connection_id)
            .await
            .map_err(MetricsError::Store)?
            .and_then(|record| {
                match serde_json::from_value::<RevenueResult>(record.payload.clone()) {
                    Ok(result) => Some((record, result)),
                    Err(err) => {
                        warn!(cache_key = cache_key.as_str(), error = %err, "discarding undecodable cached payload");
                        None
                    }
                }
            });

        let decision = self.cache.decide(
            cached.as_ref().map(|(record, _)| record),
            request.force,
            Utc::now(),
        );

        let (data, record, hit, cooldown_remaining_seconds) = match (decision, cached) {
            (
                CacheDecision::Serve {
                    record,
                    cooldown_remaining_secs,
                },
                Some((_, result)),
            ) => {
                debug!(cache_key = cache_key.as_str(), cooldown_remaining_secs, "serving cached revenue");
                (result, record, true, cooldown_remaining_secs)
            }
            _ => {
                let result = self.compute(connection, request).await?;
                let payload = serde_json::to_value(&result)?;
                let record = self
                    .cache
                    .write(user_id, &cache_key, connection_id, payload)
                    .await
                    .map_err(MetricsError::Store)?;
                info!(
                    cache_key = cache_key.as_str(),
                    total = result.total,
                    unique_leads = result.unique_leads,
                    "computed revenue"
                );
                (result, record, false, 0)
            }
        };

        let window = &request.range.window;
        Ok(RevenueResponse {
            data,
            context: RevenueContext {
                timezone: request.timezone.clone(),
                currency: self.currency.clone(),
                filters: FilterContext {
                    pipeline_ids: request.filters.pipeline_ids.clone(),
                    user_ids: request.filters.user_ids.clone(),
                    status_ids: request.filters.status_ids.clone(),
                    stage_label: request.stage_label.clone(),
                    stage_raw: request.stage_raw.clone(),
                },
                range: RangeContext {
                    label: request.range.label.clone(),
                    current_from: window.current_from,
                    current_to: window.current_to,
                    previous_from: window.previous_from,
                    previous_to: window.previous_to,
                },
            },
            cache: CacheStatus {
                hit,
                cached_at: record.updated_at,
                expires_at: record.ttl_expires_at,
                force_applied: request.force && !hit,
                cooldown_remaining_seconds,
            },
        })
    }

    async fn compute(
        &self,
        connection: &ResolvedConnection,
        request: &RevenueRequest,
    ) -> Result<RevenueResult, MetricsError> {
        let tz = parse_timezone(&request.timezone)?;
        let window = &request.range.window;
        let (from, to) = window.combined_bounds();

        let events = self
            .source
            .events_in_window(&connection.account_domain, &connection.auth, from, to)
            .await?;

        let mut seen = HashSet::new();
        let lead_ids: Vec<i64> = events
            .iter()
            .map(|e| e.entity_id)
            .filter(|id| seen.insert(*id))
            .collect();
        let leads = if lead_ids.is_empty() {
            Vec::new()
        } else {
            self.source
                .leads_by_ids(&connection.account_domain, &connection.auth, &lead_ids)
                .await?
        };

        debug!(events = events.len(), leads = leads.len(), "fetched revenue inputs");
        Ok(compute_revenue_metric(&events, &leads, window, &request.filters, tz))
    }

    pub async fn load_options(&self, user_id: &str) -> Result<CrmOptions, MetricsError> {
        let connection = self.connection_for(user_id).await?;
        let (timezone, _) = self.timezone_for(&connection)?;
        let (pipelines, users) = tokio::try_join!(
            self.source
                .pipelines(&connection.account_domain, &connection.auth),
            self.source.users(&connection.account_domain, &connection.auth),
        )?;

        Ok(CrmOptions {
            timezone,
            account_domain: connection.account_domain.clone(),
            pipelines: pipelines.iter().map(PipelineOption::from).collect(),
            users,
            metadata: connection.metadata.clone(),
            updated_at: connection.updated_at,
        })
    }
}

pub async fn orchestrator_from_env() -> anyhow::Result<RevenueOrchestrator> {
    let config = MetricsConfig::from_env();
    parse_timezone(&config.default_timezone)?;

    let client = CrmClient::new(config.client_config()).context("building CRM client")?;
    let source = Arc::new(MetadataService::new(Arc::new(client)));
    let store = config.open_store().await?;
    let resolver = Arc::new(config.static_resolver()?);

    Ok(RevenueOrchestrator::new(
        resolver,
        source,
        MetricsCache::new(store, config.cache_config()),
    )
    .with_default_timezone(config.default_timezone)
    .with_currency(config.currency))
}
