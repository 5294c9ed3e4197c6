use axum::body::{to_bytes, Body};
use axum::http::Request;
use herald_db::InMemoryJobStore;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use super::*;

fn limited_app(store: &InMemoryJobStore, auth: AuthState, rate_limit: RateLimitState) -> Router {
    build_app(
        AppState {
            store: Arc::new(store.clone()),
            job_max_retries: 3,
        },
        auth,
        rate_limit,
    )
}

fn app_with(store: &InMemoryJobStore, auth: AuthState) -> Router {
    limited_app(
        store,
        auth,
        RateLimitState::new(120, std::time::Duration::from_secs(60)),
    )
}

fn open_app(store: &InMemoryJobStore) -> Router {
    app_with(store, AuthState::from_keys(&[], false).expect("auth"))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("json parse")
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[test]
fn normalize_limit_applies_defaults_and_bounds() {
    assert_eq!(normalize_limit(None), 50);
    assert_eq!(normalize_limit(Some(0)), 1);
    assert_eq!(normalize_limit(Some(1_000)), 200);
    assert_eq!(normalize_limit(Some(25)), 25);
}

#[test]
fn api_error_validation_error_maps_to_bad_request() {
    let response = ApiError::new("req-1", "validation_error", "invalid input").into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn invalid_transition_maps_to_conflict() {
    let err = DbError::InvalidTransition {
        id: Uuid::new_v4(),
        expected_status: "pending or running",
    };
    assert_eq!(map_db_error("req".to_string(), &err).error.code, "conflict");
}

#[tokio::test]
async fn health_reports_ok_with_request_id() {
    let store = InMemoryJobStore::default();
    let request = Request::builder()
        .uri("/api/v1/health")
        .header("x-request-id", "req-abc")
        .body(Body::empty())
        .expect("request");

    let (status, json) = send(open_app(&store), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["meta"]["request_id"], "req-abc");
}

#[tokio::test]
async fn create_job_then_conflict_while_active() {
    let store = InMemoryJobStore::default();
    let recipient = Uuid::new_v4();
    let body = json!({"recipient_id": recipient, "spec": {"genre": "poem"}, "immediate": true});

    let (status, json) = send(open_app(&store), post_json("/api/v1/jobs", &body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["immediate_delivery"], true);
    assert_eq!(json["data"]["max_retries"], 3);

    let (status, json) = send(open_app(&store), post_json("/api/v1/jobs", &body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "conflict");
    assert_eq!(store.jobs().len(), 1);
}

#[tokio::test]
async fn get_job_and_unknown_job() {
    let store = InMemoryJobStore::default();
    let job = store
        .create_job(
            herald_core::NewGenerationJob::manual(Uuid::new_v4(), json!({}), 3, false),
            Utc::now(),
        )
        .await
        .unwrap()
        .created()
        .cloned()
        .unwrap();

    let (status, json) = send(open_app(&store), get(&format!("/api/v1/jobs/{}", job.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["id"], job.id.to_string());

    let (status, _) = send(
        open_app(&store),
        get(&format!("/api/v1/jobs/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn abort_job_moves_it_to_failed_and_lists_it() {
    let store = InMemoryJobStore::default();
    let job = store
        .create_job(
            herald_core::NewGenerationJob::manual(Uuid::new_v4(), json!({}), 3, false),
            Utc::now(),
        )
        .await
        .unwrap()
        .created()
        .cloned()
        .unwrap();
    let uri = format!("/api/v1/jobs/{}/abort", job.id);

    let (status, json) = send(open_app(&store), post_json(&uri, &json!({"reason": "bad spec"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "failed");
    assert_eq!(json["data"]["error_message"], "aborted: bad spec");

    let (status, _) = send(open_app(&store), post_json(&uri, &json!({"reason": "again"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(open_app(&store), post_json(&uri, &json!({"reason": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = send(open_app(&store), get("/api/v1/jobs/failed?limit=5")).await;
    assert_eq!(json["data"].as_array().map(Vec::len), Some(1));

    let (_, json) = send(open_app(&store), get("/api/v1/jobs/stats")).await;
    assert_eq!(json["data"]["failed"], 1);
    assert_eq!(json["data"]["pending"], 0);
}

#[tokio::test]
async fn delivery_endpoints_return_stats_and_failures() {
    let store = InMemoryJobStore::default();

    let (status, json) = send(open_app(&store), get("/api/v1/deliveries/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["sent"], 0);
    assert_eq!(json["data"]["upcoming_24h"], 0);

    let (status, json) = send(open_app(&store), get("/api/v1/deliveries/failed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], json!([]));
}

#[tokio::test]
async fn protected_routes_require_bearer_token_when_enabled() {
    let store = InMemoryJobStore::default();
    let auth = AuthState::from_keys(&["secret".to_string()], false).expect("auth");

    let (status, json) = send(app_with(&store, auth.clone()), get("/api/v1/jobs/stats")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "unauthorized");

    let request = Request::builder()
        .uri("/api/v1/jobs/stats")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(app_with(&store, auth.clone()), request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(app_with(&store, auth), get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn exhausted_budget_returns_429_envelope_with_retry_after() {
    let store = InMemoryJobStore::default();
    let auth = AuthState::from_keys(&[], false).expect("auth");
    let app = limited_app(
        &store,
        auth,
        RateLimitState::new(1, std::time::Duration::from_secs(30)),
    );

    let (status, _) = send(app.clone(), get("/api/v1/jobs/stats")).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri("/api/v1/jobs/stats")
        .header("x-request-id", "req-limited")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .expect("ascii")
        .parse()
        .expect("seconds");
    assert!((1..=30).contains(&retry_after));
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let json: Value = serde_json::from_slice(&body).expect("json parse");
    assert_eq!(json["error"]["code"], "rate_limited");
    assert_eq!(json["meta"]["request_id"], "req-limited");

    let (status, _) = send(app, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
}
