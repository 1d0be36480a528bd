//! Core domain model for kpulse: CRM reference data, stage-change events and revenue results.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "kpulse-core";

/// Status type code the CRM assigns to "closed won" stages.
pub const WON_STATUS_TYPE: i64 = 1;
/// Status type code the CRM assigns to "closed lost" stages.
pub const LOST_STATUS_TYPE: i64 = 2;
/// Well-known id of the default won stage present in every pipeline.
pub const DEFAULT_WON_STATUS_ID: i64 = 142;
/// Well-known id of the default lost stage present in every pipeline.
pub const DEFAULT_LOST_STATUS_ID: i64 = 143;

/// Credential used to build the `Authorization` header of outbound CRM calls.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthCredential {
    BearerToken {
        token: String,
    },
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl AuthCredential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::BearerToken {
            token: token.into(),
        }
    }

    pub fn authorization_header(&self) -> String {
        match self {
            Self::BearerToken { token } => format!("Bearer {token}"),
            Self::OAuth { access_token, .. } => format!("Bearer {access_token}"),
        }
    }
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BearerToken { .. } => f
                .debug_struct("BearerToken")
                .field("token", &"<redacted>")
                .finish(),
            Self::OAuth {
                refresh_token,
                expires_at,
                ..
            } => f
                .debug_struct("OAuth")
                .field("access_token", &"<redacted>")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "<redacted>"))
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// One stage of a sales pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sort: i64,
    #[serde(rename = "type", default)]
    pub type_code: Option<i64>,
    #[serde(default)]
    pub color: Option<String>,
}

impl PipelineStatus {
    pub fn is_won(&self) -> bool {
        self.type_code == Some(WON_STATUS_TYPE) || self.id == DEFAULT_WON_STATUS_ID
    }

    pub fn is_lost(&self) -> bool {
        self.type_code == Some(LOST_STATUS_TYPE) || self.id == DEFAULT_LOST_STATUS_ID
    }
}

/// Sales pipeline with its stages and the derived won/lost id sets.
///
/// The two predicates are evaluated independently, so a status carrying
/// inconsistent CRM data (e.g. id 142 with the lost type code) is listed in
/// both sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    pub is_main: bool,
    pub statuses: Vec<PipelineStatus>,
    pub won_status_ids: Vec<i64>,
    pub lost_status_ids: Vec<i64>,
}

impl Pipeline {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        is_main: bool,
        statuses: Vec<PipelineStatus>,
    ) -> Self {
        let won_status_ids = statuses.iter().filter(|s| s.is_won()).map(|s| s.id).collect();
        let lost_status_ids = statuses.iter().filter(|s| s.is_lost()).map(|s| s.id).collect();
        Self {
            id,
            name: name.into(),
            is_main,
            statuses,
            won_status_ids,
            lost_status_ids,
        }
    }

    pub fn status(&self, status_id: i64) -> Option<&PipelineStatus> {
        self.statuses.iter().find(|s| s.id == status_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
}

/// Audit-log entry recording a lead moving between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChangeEvent {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Lead id.
    pub entity_id: i64,
    /// Epoch seconds.
    pub created_at: i64,
    #[serde(default)]
    pub value_before: Option<StatusSnapshot>,
    #[serde(default)]
    pub value_after: Option<StatusSnapshot>,
}

impl StageChangeEvent {
    pub fn created_at_ms(&self) -> i64 {
        self.created_at.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub price: f64,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub closed_at: Option<i64>,
}

/// Allow-lists restricting which events count. An empty list leaves that
/// dimension unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueFilters {
    #[serde(default)]
    pub pipeline_ids: Vec<i64>,
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub status_ids: Vec<i64>,
}

impl RevenueFilters {
    pub fn is_unrestricted(&self) -> bool {
        self.pipeline_ids.is_empty() && self.user_ids.is_empty() && self.status_ids.is_empty()
    }

    pub fn normalized(&self) -> Self {
        Self {
            pipeline_ids: sorted_unique(&self.pipeline_ids),
            user_ids: sorted_unique(&self.user_ids),
            status_ids: sorted_unique(&self.status_ids),
        }
    }

    pub fn admits(
        &self,
        pipeline_id: Option<i64>,
        status_id: Option<i64>,
        responsible_user_id: Option<i64>,
    ) -> bool {
        allow_list_admits(&self.pipeline_ids, pipeline_id)
            && allow_list_admits(&self.status_ids, status_id)
            && allow_list_admits(&self.user_ids, responsible_user_id)
    }
}

fn allow_list_admits(allowed: &[i64], value: Option<i64>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    value.is_some_and(|v| allowed.contains(&v))
}

pub fn sorted_unique(ids: &[i64]) -> Vec<i64> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Current window plus the equal-length window immediately preceding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub current_from: DateTime<Utc>,
    pub current_to: DateTime<Utc>,
    pub previous_from: DateTime<Utc>,
    pub previous_to: DateTime<Utc>,
}

impl TimeWindow {
    /// Derives the previous window: it ends 1ms before `current_from` and
    /// spans the same duration as the current one.
    pub fn preceding(
        current_from: DateTime<Utc>,
        current_to: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if current_to < current_from {
            return Err(ValidationError::InvertedWindow {
                from: current_from,
                to: current_to,
            });
        }
        let duration = current_to - current_from;
        let previous_to = current_from - Duration::milliseconds(1);
        let previous_from = previous_to - duration;
        Ok(Self {
            current_from,
            current_to,
            previous_from,
            previous_to,
        })
    }

    pub fn duration(&self) -> Duration {
        self.current_to - self.current_from
    }

    pub fn combined_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.previous_from.min(self.current_from),
            self.previous_to.max(self.current_to),
        )
    }

    pub fn current_contains_ms(&self, epoch_ms: i64) -> bool {
        epoch_ms >= self.current_from.timestamp_millis()
            && epoch_ms <= self.current_to.timestamp_millis()
    }

    pub fn previous_contains_ms(&self, epoch_ms: i64) -> bool {
        epoch_ms >= self.previous_from.timestamp_millis()
            && epoch_ms <= self.previous_to.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSeriesPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueResult {
    pub total: f64,
    pub previous_total: f64,
    pub trend_percentage: Option<f64>,
    pub series: Vec<RevenueSeriesPoint>,
    pub unique_leads: usize,
    pub previous_unique_leads: usize,
    pub generated_at: DateTime<Utc>,
    pub range: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCacheRecord {
    pub payload: serde_json::Value,
    pub ttl_expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetricsCacheRecord {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expires_at > now
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }
}

/// Input rejected before any outbound call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("window end {to} precedes its start {from}")]
    InvertedWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error("invalid id `{value}` in {dimension} filter")]
    InvalidId { dimension: String, value: String },
    #[error("unknown range `{0}`")]
    UnknownRange(String),
    #[error("custom range needs `from` and `to` dates (YYYY-MM-DD): {0}")]
    InvalidCustomRange(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    })
}
