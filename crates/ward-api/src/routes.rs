use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use ward_core::audit::{AuditQuery, LibSqlAuditLog, SharedAuditLog};
use ward_core::db::Database;
use ward_core::models::{AuditEntry, DocumentKey, HttpMethod};
use ward_core::store::route::{
    apply_write, parse_version_tag, WriteRequest, IDEMPOTENCY_KEY_HEADER, IF_MATCH_HEADER,
};
use ward_core::store::VersionStore;
use ward_core::VersionedResource;

use crate::config::AppConfig;
use crate::error::AppError;

const MAX_AUDIT_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: VersionStore,
    audit: SharedAuditLog,
}

impl AppState {
    pub async fn open(config: Arc<AppConfig>) -> ward_core::Result<Self> {
        let db = Database::open(&config.db_path).await?.shared();
        let audit: SharedAuditLog = Arc::new(LibSqlAuditLog::new(db.clone()));
        let store =
            VersionStore::new(db, config.sync.channel_capacity).with_audit(Arc::clone(&audit));
        Ok(Self {
            config,
            store,
            audit,
        })
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/fhir/{resource_type}", post(create_resource))
        .route(
            "/fhir/{resource_type}/{id}",
            get(read_resource)
                .put(replace_resource)
                .patch(patch_resource),
        )
        .route("/fhir/{resource_type}/{id}/_history", get(resource_history))
        .route("/audit", get(audit_entries))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    let url = format!("/fhir/{resource_type}");
    write_resource(&state, HttpMethod::Post, url, &headers, body).await
}

async fn replace_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    let url = format!("/fhir/{resource_type}/{id}");
    write_resource(&state, HttpMethod::Put, url, &headers, body).await
}

async fn patch_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    let url = format!("/fhir/{resource_type}/{id}");
    write_resource(&state, HttpMethod::Patch, url, &headers, body).await
}

async fn write_resource(
    state: &AppState,
    method: HttpMethod,
    url: String,
    headers: &HeaderMap,
    body: Value,
) -> Result<Response, AppError> {
    let request = WriteRequest {
        method,
        url,
        body,
        idempotency_key: header_text(headers, IDEMPOTENCY_KEY_HEADER)?,
        observed_version: header_text(headers, IF_MATCH_HEADER)?
            .map(|value| {
                parse_version_tag(&value)
                    .ok_or_else(|| AppError::bad_request(format!("invalid If-Match: {value}")))
            })
            .transpose()?,
    };
    let idempotent = request.idempotency_key.is_some();

    let result = apply_write(&state.store, request).await?;
    tracing::info!(
        method = method.as_str(),
        document = %result.resource.key(),
        version_id = result.resource.version_id,
        idempotent,
        "Applied write"
    );
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(resource_response(status, &result.resource))
}

async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let resource = state.store.get(&resource_type, &id).await?;
    Ok(resource_response(StatusCode::OK, &resource))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryBundle {
    resource_type: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    total: usize,
    entry: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    resource: Value,
    parent_version: Option<i64>,
    revision_id: String,
    #[serde(rename = "_conflictFlag", skip_serializing_if = "Option::is_none")]
    conflict_flag: Option<String>,
}

/// Every retained revision, newest first
async fn resource_history(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Json<HistoryBundle>, AppError> {
    let history = state
        .store
        .history(&DocumentKey::new(resource_type, id))
        .await?;
    let entry: Vec<HistoryEntry> = history
        .into_iter()
        .rev()
        .map(|revision| HistoryEntry {
            resource: revision.resource.to_document(),
            parent_version: revision.parent_version,
            revision_id: revision.resource.revision_id.to_string(),
            conflict_flag: revision.conflict_flag,
        })
        .collect();
    Ok(Json(HistoryBundle {
        resource_type: "Bundle",
        kind: "history",
        total: entry.len(),
        entry,
    }))
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    target: Option<String>,
    limit: Option<usize>,
}

async fn audit_entries(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(state.config.audit_default_limit)
        .clamp(1, MAX_AUDIT_LIMIT);
    let query = AuditQuery {
        target_id: params.target.filter(|target| !target.trim().is_empty()),
        limit,
    };
    Ok(Json(state.audit.recent(&query).await?))
}

fn header_text(headers: &HeaderMap, name: &str) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| AppError::bad_request(format!("{name} must be visible ASCII")))?
        .trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

fn resource_response(status: StatusCode, resource: &VersionedResource) -> Response {
    let mut response = (status, Json(resource.to_document())).into_response();
    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&format!("W/\"{}\"", resource.version_id)) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(location) = HeaderValue::from_str(&format!(
        "/fhir/{}/{}/_history/{}",
        resource.resource_type, resource.id, resource.version_id
    )) {
        headers.insert(header::LOCATION, location);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;
    use ward_core::conflict::ConflictWatcher;

    use super::*;

    async fn test_state() -> AppState {
        AppState::open(Arc::new(AppConfig::for_tests()))
            .await
            .unwrap()
    }

    fn json_request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
    }

    async fn send(
        state: &AppState,
        builder: axum::http::request::Builder,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
        let response = app_router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, value)
    }

    async fn write(state: &AppState, method: &str, uri: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        send(state, json_request(method, uri), Some(body)).await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_reports_ok() {
        let state = test_state().await;
        let (status, _, body) = send(
            &state,
            Request::builder().uri("/healthz"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_returns_version_one_with_etag() {
        let state = test_state().await;
        let (status, headers, body) = write(
            &state,
            "POST",
            "/fhir/Observation",
            json!({"resourceType": "Observation", "id": "obs-1", "status": "final"}),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers[header::ETAG], "W/\"1\"");
        assert_eq!(headers[header::LOCATION], "/fhir/Observation/obs-1/_history/1");
        assert_eq!(body["meta"]["versionId"], "1");

        let (status, _, body) = send(
            &state,
            Request::builder().uri("/fhir/Observation/obs-1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "final");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_bodies_use_error_and_details_body() {
        let state = test_state().await;

        let malformed = json_request("POST", "/fhir/Observation")
            .body(Body::from("{\"resourceType\": "))
            .unwrap();
        let response = app_router(state.clone()).oneshot(malformed).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "invalid_body");
        assert!(!body["details"].as_str().unwrap().is_empty());

        let (status, _, body) = send(
            &state,
            Request::builder()
                .method("PATCH")
                .uri("/fhir/Patient/42")
                .header(header::CONTENT_TYPE, "text/plain"),
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["error"], "invalid_body");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_use_error_and_details_body() {
        let state = test_state().await;

        let (status, _, body) = write(
            &state,
            "PUT",
            "/fhir/Patient/missing",
            json!({"resourceType": "Patient"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert!(body["details"].as_str().unwrap().contains("Patient/missing"));

        let (status, _, body) = write(
            &state,
            "POST",
            "/fhir/Observation",
            json!({"resourceType": "Patient"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_resource");

        let body = json!({"resourceType": "Observation"});
        let (status, _, response) = send(
            &state,
            json_request("POST", "/fhir/Observation").header(IF_MATCH_HEADER, "W/\"abc\""),
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"], "invalid_request");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idempotency_key_applies_once() {
        let state = test_state().await;
        write(
            &state,
            "POST",
            "/fhir/Patient",
            json!({"resourceType": "Patient", "id": "42"}),
        )
        .await;

        let body = json!({"active": false});
        let mut versions = Vec::new();
        for _ in 0..2 {
            let (status, _, response) = send(
                &state,
                json_request("PATCH", "/fhir/Patient/42")
                    .header(IDEMPOTENCY_KEY_HEADER, "0190f3b2-replay"),
                Some(body.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            versions.push(response["meta"]["versionId"].clone());
        }
        assert_eq!(versions, vec![json!("2"), json!("2")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_edits_are_flagged_in_history() {
        let state = test_state().await;
        let watcher = ConflictWatcher::spawn(state.store.clone());
        let mut notifications = watcher.subscribe();

        write(
            &state,
            "POST",
            "/fhir/Patient",
            json!({"resourceType": "Patient", "id": "42"}),
        )
        .await;
        for family in ["Tran", "Le"] {
            let body = json!({"name": [{"family": family}]});
            let (status, _, _) = send(
                &state,
                json_request("PATCH", "/fhir/Patient/42").header(IF_MATCH_HEADER, "W/\"1\""),
                Some(body),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.document_id, "Patient/42");

        let (status, _, bundle) = send(
            &state,
            Request::builder().uri("/fhir/Patient/42/_history"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bundle["total"], 3);
        let flags: Vec<&Value> = bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| &entry["_conflictFlag"])
            .collect();
        assert_eq!(flags, vec![&Value::Null, &json!("updated_on_device"), &Value::Null]);

        let (_, _, entries) = send(
            &state,
            Request::builder().uri("/audit?target=Patient/42&limit=10"),
            None,
        )
        .await;
        let mut actions: Vec<&str> = entries
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["action"].as_str().unwrap())
            .collect();
        actions.sort_unstable();
        assert_eq!(actions, vec!["create", "mark_stale", "update", "update"]);
    }
}
