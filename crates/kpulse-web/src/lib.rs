//! JSON surface for kpulse: revenue metric, filter options and a health probe.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kpulse_client::CrmErrorKind;
use kpulse_metrics::{MetricsError, RevenueOrchestrator, RevenueQuery};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "kpulse-web";

/// Header carrying the id of the user authenticated upstream.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RevenueOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: RevenueOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/metrics/revenue", get(revenue_handler))
        .route("/api/crm/options", get(options_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("KPULSE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(kpulse_metrics::orchestrator_from_env().await?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "kpulse web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn revenue_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RevenueQuery>,
) -> Response {
    let Some(user_id) = user_id(&headers) else {
        return unauthorized();
    };
    match state.orchestrator.handle_query(&user_id, &query).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn options_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user_id) = user_id(&headers) else {
        return unauthorized();
    };
    match state.orchestrator.load_options(&user_id).await {
        Ok(options) => Json(options).into_response(),
        Err(err) => error_response(&err),
    }
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "missing authenticated user")
}

fn error_status(err: &MetricsError) -> (StatusCode, String) {
    match err {
        MetricsError::Validation(inner) => (StatusCode::BAD_REQUEST, inner.to_string()),
        MetricsError::ConnectionNotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        MetricsError::Crm(inner) => match inner.crm().map(|e| e.kind()) {
            Some(CrmErrorKind::Auth) => (
                StatusCode::UNAUTHORIZED,
                "CRM rejected the stored credentials; reconnect the account".to_string(),
            ),
            Some(CrmErrorKind::RateLimited) => (
                StatusCode::TOO_MANY_REQUESTS,
                "CRM rate limit reached; try again shortly".to_string(),
            ),
            _ => (StatusCode::BAD_GATEWAY, inner.to_string()),
        },
        MetricsError::Connection(_) | MetricsError::Store(_) | MetricsError::Encode(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(err: &MetricsError) -> Response {
    let (status, message) = error_status(err);
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "revenue request failed");
    }
    json_error(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use kpulse_client::{
        ClientError, ConnectionError, CrmDataSource, CrmRequestError, CredentialResolver,
        ResolvedConnection, StaticCredentialResolver,
    };
    use kpulse_core::{
        AuthCredential, Lead, Pipeline, PipelineStatus, StageChangeEvent, StatusSnapshot, UserRef,
    };
    use kpulse_storage::{InMemoryMetricsStore, MetricsCache, MetricsCacheConfig};
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedSource {
        fail_with: Option<u16>,
    }

    impl FixedSource {
        fn check(&self) -> Result<(), ClientError> {
            match self.fail_with {
                Some(status) => Err(ClientError::Request(CrmRequestError {
                    status,
                    message: format!("{status}"),
                    detail: None,
                })),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CrmDataSource for FixedSource {
        async fn pipelines(&self, _: &str, _: &AuthCredential) -> Result<Vec<Pipeline>, ClientError> {
            self.check()?;
            let won = PipelineStatus {
                id: 142,
                name: "Won".to_string(),
                sort: 10000,
                type_code: Some(1),
                color: None,
            };
            Ok(vec![Pipeline::new(1, "Sales", true, vec![won])])
        }

        async fn users(&self, _: &str, _: &AuthCredential) -> Result<Vec<UserRef>, ClientError> {
            self.check()?;
            Ok(vec![UserRef {
                id: 7,
                name: "Ana".to_string(),
                email: Some("ana@example.com".to_string()),
                is_active: Some(true),
            }])
        }

        async fn events_in_window(
            &self,
            _: &str,
            _: &AuthCredential,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<StageChangeEvent>, ClientError> {
            self.check()?;
            Ok(vec![StageChangeEvent {
                id: "e1".to_string(),
                entity_id: 1,
                created_at: (Utc::now() - chrono::Duration::hours(1)).timestamp(),
                value_before: None,
                value_after: Some(StatusSnapshot {
                    pipeline_id: Some(1),
                    status_id: Some(142),
                    responsible_user_id: Some(7),
                }),
            }])
        }

        async fn leads_by_ids(&self, _: &str, _: &AuthCredential, _: &[i64]) -> Result<Vec<Lead>, ClientError> {
            self.check()?;
            Ok(vec![Lead {
                id: 1,
                price: 500.0,
                pipeline_id: Some(1),
                status_id: Some(142),
                responsible_user_id: Some(7),
                created_at: None,
                closed_at: None,
            }])
        }
    }

    struct NobodyConnected;

    #[async_trait]
    impl CredentialResolver for NobodyConnected {
        async fn resolve(&self, _: &str) -> Result<Option<ResolvedConnection>, ConnectionError> {
            Ok(None)
        }
    }

    fn test_app(fail_with: Option<u16>) -> Router {
        let orchestrator = RevenueOrchestrator::new(
            Arc::new(StaticCredentialResolver::new("acme", AuthCredential::bearer("t"), None)),
            Arc::new(FixedSource { fail_with }),
            MetricsCache::new(Arc::new(InMemoryMetricsStore::new()), MetricsCacheConfig::default()),
        );
        app(AppState::new(orchestrator))
    }

    fn get(uri: &str, user: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let resp = test_app(None).oneshot(get("/healthz", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn handler_smoke_revenue_json() {
        let app = test_app(None);
        let resp = app
            .clone()
            .oneshot(get("/api/metrics/revenue?range=7d&stage=won", Some("u1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["data"]["total"], 500.0);
        assert_eq!(body["data"]["series"].as_array().unwrap().len(), 7);
        assert_eq!(body["context"]["filters"]["statusIds"][0], 142);
        assert_eq!(body["context"]["filters"]["stageRaw"], "won");
        assert_eq!(body["cache"]["hit"], false);

        let again = app
            .oneshot(get("/api/metrics/revenue?range=7d&stage=won", Some("u1")))
            .await
            .unwrap();
        assert_eq!(json_body(again).await["cache"]["hit"], true);
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() {
        let resp = test_app(None)
            .oneshot(get("/api/metrics/revenue", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(json_body(resp).await["message"].is_string());
    }

    #[tokio::test]
    async fn malformed_filters_are_bad_requests() {
        let resp = test_app(None)
            .oneshot(get("/api/metrics/revenue?users=1,bob", Some("u1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test_app(None)
            .oneshot(get("/api/metrics/revenue?range=custom&from=2024-06-05&to=2024-06-01", Some("u1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn crm_failures_map_to_distinct_statuses() {
        for (upstream, expected) in [
            (401, StatusCode::UNAUTHORIZED),
            (429, StatusCode::TOO_MANY_REQUESTS),
            (503, StatusCode::BAD_GATEWAY),
            (0, StatusCode::BAD_GATEWAY),
        ] {
            let resp = test_app(Some(upstream))
                .oneshot(get("/api/metrics/revenue", Some("u1")))
                .await
                .unwrap();
            assert_eq!(resp.status(), expected, "upstream status {upstream}");
        }
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let orchestrator = RevenueOrchestrator::new(
            Arc::new(NobodyConnected),
            Arc::new(FixedSource { fail_with: None }),
            MetricsCache::new(Arc::new(InMemoryMetricsStore::new()), MetricsCacheConfig::default()),
        );
        let resp = app(AppState::new(orchestrator))
            .oneshot(get("/api/crm/options", Some("u1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_smoke_options_json() {
        let resp = test_app(None)
            .oneshot(get("/api/crm/options", Some("u1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["accountDomain"], "acme");
        assert_eq!(body["pipelines"][0]["wonStatusIds"][0], 142);
        assert_eq!(body["pipelines"][0]["statuses"][0]["isWon"], true);
        assert_eq!(body["users"][0]["name"], "Ana");
    }
}
