use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    attach::AttachRequest,
    dispatch::{DispatchReport, EndpointResult},
    logging::{ApiError, LogError, WebResult},
    model::{DueItem, PushPayload, PushRegistration, SubscriptionUpsert},
    rate_limiter::{rate_limit, RateLimit},
    reminder::{checked_lookahead, scan_window, ItemResult, PassOptions, PassReport},
    server_state::ServerState,
};

const API_KEY_HEADER: &str = "x-api-key";
const DEBUG_PREVIEW: usize = 5;

/// Shape shared by every route that triggers a dispatch.
#[derive(Serialize, Debug)]
pub struct DispatchResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<usize>,
    pub notified: usize,
    pub results: Vec<T>,
}

impl From<PassReport> for DispatchResponse<ItemResult> {
    fn from(report: PassReport) -> Self {
        DispatchResponse {
            ok: true,
            checked: Some(report.checked),
            notified: report.notified,
            results: report.results,
        }
    }
}

impl From<DispatchReport> for DispatchResponse<EndpointResult> {
    fn from(report: DispatchReport) -> Self {
        DispatchResponse {
            ok: true,
            checked: None,
            notified: report.sent_count,
            results: report.per_endpoint_results,
        }
    }
}

fn require_bearer(headers: &HeaderMap, secret: Option<&str>) -> WebResult<()> {
    let secret = secret.ok_or(ApiError::Misconfigured)?;
    let token = headers
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ApiError::Unauthorized)?;

    if token.token() != secret {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn require_api_key(headers: &HeaderMap, key: Option<&str>) -> WebResult<()> {
    let key = key.ok_or(ApiError::Misconfigured)?;
    let supplied = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if supplied != key {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

async fn status() -> &'static str {
    "ok"
}

async fn vapid_public_key(State(state): State<ServerState>) -> WebResult<Json<Value>> {
    let key = state
        .config
        .vapid_pubkey
        .clone()
        .ok_or(ApiError::Misconfigured)?;

    Ok(Json(json!({ "publicKey": key })))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    subscription: Option<Value>,
    device_id: Option<String>,
}

async fn subscribe(
    State(state): State<ServerState>,
    Json(request): Json<RegisterRequest>,
) -> WebResult<(StatusCode, Json<Value>)> {
    let raw = request
        .subscription
        .ok_or_else(|| ApiError::BadRequest("No subscription provided".to_string()))?;
    let registration = PushRegistration::from_raw(raw).log_error_bad_request()?;

    let stored = state
        .subscriptions
        .upsert(SubscriptionUpsert::anonymous(registration, request.device_id))
        .await
        .log_error_internal()?;

    tracing::info!(endpoint = %stored.endpoint, "Subscription registered.");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "endpoint": stored.endpoint, "userId": stored.user_id })),
    ))
}

#[derive(Deserialize, Debug, Default)]
struct NotifyDueQuery {
    force: Option<String>,
    lookahead: Option<u32>,
}

impl NotifyDueQuery {
    fn force(&self) -> bool {
        matches!(self.force.as_deref(), Some("1") | Some("true"))
    }
}

async fn notify_due(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<NotifyDueQuery>,
) -> WebResult<Json<DispatchResponse<ItemResult>>> {
    require_bearer(&headers, state.config.cron_secret.as_deref())?;
    let lookahead_days = checked_lookahead(query.lookahead.unwrap_or(state.config.lookahead_days))
        .log_error_bad_request()?;
    let scanner = state.scanner().log_error_misconfigured()?;

    let options = PassOptions {
        now: Utc::now(),
        lookahead_days,
        throttle_interval: state.config.throttle_interval,
        force: query.force(),
    };
    let report = scanner
        .run_due_reminder_pass(options)
        .await
        .log_error_internal()?;

    Ok(Json(report.into()))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AdminSendRequest {
    title: String,
    body: String,
    url: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    broadcast: bool,
}

async fn send_notification(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<AdminSendRequest>,
) -> WebResult<Json<DispatchResponse<EndpointResult>>> {
    require_api_key(&headers, state.config.admin_api_key.as_deref())?;
    let engine = state.engine().log_error_misconfigured()?;

    let payload = PushPayload::new(&request.title, &request.body, request.url.as_deref());
    let report = match (request.user_id.as_deref(), request.broadcast) {
        (Some(user_id), false) => engine.send_to_user(user_id, &payload).await,
        (None, true) => engine.send_to_all(&payload).await,
        _ => {
            return Err(ApiError::BadRequest(
                "Provide exactly one of userId or broadcast".to_string(),
            ))
        }
    }
    .log_error_internal()?;

    Ok(Json(report.into()))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AttachBody {
    user_id: String,
    #[serde(flatten)]
    request: AttachRequest,
}

async fn attach(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<AttachBody>,
) -> WebResult<(StatusCode, Json<Value>)> {
    require_api_key(&headers, state.config.admin_api_key.as_deref())?;

    state
        .attach_service()
        .spawn_attach(body.user_id, body.request);

    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true }))))
}

async fn notify_item(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(item): Json<DueItem>,
) -> WebResult<(StatusCode, Json<Value>)> {
    require_api_key(&headers, state.config.admin_api_key.as_deref())?;
    let scanner = state.scanner().log_error_misconfigured()?;

    let span = tracing::info_span!("immediate_notify", item_id = %item.id);
    let config = state.config.clone();
    tokio::spawn(
        async move {
            let result = scanner
                .notify_item(
                    &item,
                    Utc::now(),
                    config.lookahead_days,
                    config.throttle_interval,
                )
                .await;
            tracing::info!(?result, "Immediate notify finished.");
        }
        .instrument(span),
    );

    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true }))))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubscriptionPreview {
    endpoint: String,
    device_id: Option<String>,
    user_id: Option<String>,
    is_active: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DueSubscriptions {
    item_id: String,
    label: String,
    deadline: DateTime<Utc>,
    owner_id: String,
    subscriptions_found: usize,
    subs_preview: Vec<SubscriptionPreview>,
}

async fn debug_due_subscriptions(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> WebResult<Json<Value>> {
    require_api_key(&headers, state.config.admin_api_key.as_deref())?;

    let now = Utc::now();
    let window = scan_window(now, &state.config.utc_offset, state.config.lookahead_days);
    let due = state
        .items
        .find_due(window.start, window.end)
        .await
        .log_error_internal()?;

    let mut results = Vec::with_capacity(due.len());
    for item in due {
        // `find_due` only yields owned items.
        let Some(owner_id) = item.owner_id else {
            continue;
        };
        let subscriptions = state
            .subscriptions
            .find_by_user(&owner_id)
            .await
            .log_error_internal()?;

        results.push(DueSubscriptions {
            subscriptions_found: subscriptions.len(),
            subs_preview: subscriptions
                .into_iter()
                .take(DEBUG_PREVIEW)
                .map(|s| SubscriptionPreview {
                    endpoint: s.endpoint,
                    device_id: s.device_id,
                    user_id: s.user_id,
                    is_active: s.is_active,
                })
                .collect(),
            item_id: item.id,
            label: item.label,
            deadline: item.deadline,
            owner_id,
        });
    }

    Ok(Json(json!({
        "now": now,
        "windowStart": window.start,
        "windowEnd": window.end,
        "count": results.len(),
        "results": results,
    })))
}

pub fn router(state: ServerState) -> Router {
    let limited = Router::new()
        .route("/api/subscribe", post(subscribe))
        .route_layer(middleware::from_fn_with_state(
            RateLimit::per_minute(state.config.subscribe_per_minute),
            rate_limit,
        ));

    Router::new()
        .route("/", get(status))
        .route("/api/vapid-public-key", get(vapid_public_key))
        .route("/api/notify-due", post(notify_due))
        .route("/api/send-notification", post(send_notification))
        .route("/api/attach", post(attach))
        .route("/api/items/notify", post(notify_item))
        .route("/api/debug/due-subscriptions", get(debug_due_subscriptions))
        .merge(limited)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Could not listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down.");
}

pub async fn serve(state: ServerState, port: Option<u16>) -> anyhow::Result<()> {
    let port: u16 = if let Some(port) = port {
        port
    } else if let Ok(port) = std::env::var("PORT") {
        port.parse()?
    } else {
        8080
    };

    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use chrono::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::Config,
        push::{
            testing::{Outcome, ScriptedTransport},
            PushTransport,
        },
        store::{
            memory::{tests::owned, MemoryStore},
            SubscriptionStore, ThrottleLedger,
        },
    };

    const CRON: &str = "cron-secret";
    const ADMIN: &str = "admin-key";

    struct TestApp {
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        router: Router,
    }

    fn test_app(configure: impl FnOnce(&mut Config), with_transport: bool) -> TestApp {
        let mut config = Config {
            cron_secret: Some(CRON.to_string()),
            admin_api_key: Some(ADMIN.to_string()),
            vapid_pubkey: Some("BPublicKey".to_string()),
            ..Config::default()
        };
        configure(&mut config);

        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(ScriptedTransport::default());
        let dyn_transport: Option<Arc<dyn PushTransport>> = if with_transport {
            let t: Arc<dyn PushTransport> = transport.clone();
            Some(t)
        } else {
            None
        };

        let state = ServerState::in_memory(config, store.clone(), dyn_transport);
        TestApp {
            store,
            transport,
            router: router(state),
        }
    }

    fn app() -> TestApp {
        test_app(|_| {}, true)
    }

    fn json_request(uri: &str, body: Value, auth: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some((name, value)) = auth {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn cron_auth() -> Option<(&'static str, &'static str)> {
        Some(("authorization", "Bearer cron-secret"))
    }

    fn admin_auth() -> Option<(&'static str, &'static str)> {
        Some((API_KEY_HEADER, ADMIN))
    }

    #[tokio::test]
    async fn subscribe_upserts_by_endpoint() {
        let app = app();
        let body = json!({
            "subscription": { "endpoint": "https://p/e", "keys": { "p256dh": "pk", "auth": "au" } },
            "deviceId": "dev-1"
        });

        for _ in 0..2 {
            let res = app
                .router
                .clone()
                .oneshot(json_request("/api/subscribe", body.clone(), None))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::CREATED);
        }

        assert_eq!(app.store.subscription_count().await, 1);
        let stored = app.store.find_by_endpoint("https://p/e").await.unwrap().unwrap();
        assert_eq!(stored.device_id.as_deref(), Some("dev-1"));
        assert!(stored.user_id.is_none());
    }

    #[tokio::test]
    async fn subscribe_rejects_missing_endpoint() {
        let app = app();
        let res = app
            .router
            .oneshot(json_request("/api/subscribe", json!({ "deviceId": "d" }), None))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(res).await["error"], "No subscription provided");
    }

    #[tokio::test]
    async fn notify_due_requires_bearer_token() {
        let app = app();

        let missing = app
            .router
            .clone()
            .oneshot(json_request("/api/notify-due", json!({}), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .router
            .oneshot(json_request(
                "/api/notify-due",
                json!({}),
                Some(("authorization", "Bearer nope")),
            ))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn notify_due_without_secret_is_misconfigured() {
        let app = test_app(|c| c.cron_secret = None, true);
        let res = app
            .router
            .oneshot(json_request("/api/notify-due", json!({}), cron_auth()))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_json(res).await["error"], "Server misconfigured");
    }

    #[tokio::test]
    async fn notify_due_without_transport_is_misconfigured() {
        let app = test_app(|_| {}, false);
        let res = app
            .router
            .oneshot(json_request("/api/notify-due", json!({}), cron_auth()))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn notify_due_runs_a_pass() {
        let app = app();
        app.store.upsert(owned("https://p/u1", "U", None)).await.unwrap();
        app.store.upsert(owned("https://p/u2", "U", None)).await.unwrap();
        app.store
            .put_item(DueItem {
                id: "B".into(),
                owner_id: Some("U".into()),
                deadline: Utc::now() + Duration::hours(1),
                label: "Dune".into(),
            })
            .await;

        let res = app
            .router
            .clone()
            .oneshot(json_request("/api/notify-due", json!({}), cron_auth()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = read_json(res).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["checked"], 1);
        assert_eq!(body["notified"], 1);
        assert_eq!(body["results"][0]["status"], "sent");
        assert_eq!(body["results"][0]["sentCount"], 2);

        let again = app
            .router
            .clone()
            .oneshot(json_request("/api/notify-due", json!({}), cron_auth()))
            .await
            .unwrap();
        let body = read_json(again).await;
        assert_eq!(body["notified"], 0);
        assert_eq!(body["results"][0]["status"], "skipped");

        let forced = app
            .router
            .oneshot(json_request("/api/notify-due?force=1", json!({}), cron_auth()))
            .await
            .unwrap();
        assert_eq!(read_json(forced).await["notified"], 1);

        assert!(ThrottleLedger::get(app.store.as_ref(), "U", "B").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn notify_due_rejects_oversized_lookahead() {
        let app = app();

        let too_far = app
            .router
            .clone()
            .oneshot(json_request(
                "/api/notify-due?lookahead=4294967295",
                json!({}),
                cron_auth(),
            ))
            .await
            .unwrap();
        assert_eq!(too_far.status(), StatusCode::BAD_REQUEST);

        let longest = app
            .router
            .oneshot(json_request("/api/notify-due?lookahead=366", json!({}), cron_auth()))
            .await
            .unwrap();
        assert_eq!(longest.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_send_reports_removed_endpoints() {
        let app = app();
        app.store.upsert(owned("https://p/live", "U", None)).await.unwrap();
        app.store.upsert(owned("https://p/dead", "U", None)).await.unwrap();
        app.transport.script("https://p/dead", Outcome::Status(410));

        let res = app
            .router
            .oneshot(json_request(
                "/api/send-notification",
                json!({ "title": "Hi", "body": "There", "userId": "U" }),
                admin_auth(),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = read_json(res).await;
        assert_eq!(body["notified"], 1);
        assert!(body.get("checked").is_none());
        let removed: Vec<&Value> = body["results"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| r["status"] == "removed")
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0]["endpoint"], "https://p/dead");
        assert!(app.store.find_by_endpoint("https://p/dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn admin_send_broadcasts_and_validates_target() {
        let app = app();
        app.store.upsert(owned("https://p/a", "A", None)).await.unwrap();
        app.store.upsert(owned("https://p/b", "B", None)).await.unwrap();

        let res = app
            .router
            .clone()
            .oneshot(json_request(
                "/api/send-notification",
                json!({ "title": "Hi", "body": "All", "broadcast": true }),
                admin_auth(),
            ))
            .await
            .unwrap();
        assert_eq!(read_json(res).await["notified"], 2);

        let neither = app
            .router
            .clone()
            .oneshot(json_request(
                "/api/send-notification",
                json!({ "title": "Hi", "body": "?" }),
                admin_auth(),
            ))
            .await
            .unwrap();
        assert_eq!(neither.status(), StatusCode::BAD_REQUEST);

        let unauthorized = app
            .router
            .oneshot(json_request(
                "/api/send-notification",
                json!({ "title": "Hi", "body": "All", "broadcast": true }),
                Some((API_KEY_HEADER, "wrong")),
            ))
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn attach_returns_before_linking_finishes() {
        let app = app();
        app.store.upsert(owned("https://p/a", "A", Some("dev"))).await.unwrap();

        let res = app
            .router
            .oneshot(json_request(
                "/api/attach",
                json!({
                    "userId": "B",
                    "deviceId": "dev",
                    "subscription": { "endpoint": "https://p/a", "keys": { "p256dh": "x", "auth": "y" } }
                }),
                admin_auth(),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        tokio::task::yield_now().await;
        let stored = app.store.find_by_endpoint("https://p/a").await.unwrap().unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn vapid_key_and_status() {
        let app = app();
        let res = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/api/vapid-public-key").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(read_json(res).await["publicKey"], "BPublicKey");

        let res = app
            .router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn debug_view_lists_due_items_with_devices() {
        let app = app();
        app.store.upsert(owned("https://p/u", "U", Some("phone"))).await.unwrap();
        app.store
            .put_item(DueItem {
                id: "B".into(),
                owner_id: Some("U".into()),
                deadline: Utc::now() + Duration::hours(1),
                label: "Dune".into(),
            })
            .await;
        app.store
            .put_item(DueItem {
                id: "orphan".into(),
                owner_id: None,
                deadline: Utc::now() + Duration::hours(1),
                label: "Lost".into(),
            })
            .await;

        let res = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/api/debug/due-subscriptions")
                    .header(API_KEY_HEADER, ADMIN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = read_json(res).await;

        assert_eq!(body["count"], 1);
        assert_eq!(body["results"][0]["ownerId"], "U");
        assert_eq!(body["results"][0]["subscriptionsFound"], 1);
        assert_eq!(body["results"][0]["subsPreview"][0]["deviceId"], "phone");
    }
}
