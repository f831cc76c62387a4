/**
 * API HTTP BRASERO - Surface REST + stream WebSocket du kernel
 *
 * RÔLE : Interface entre le dashboard et le moteur : consultation des devices,
 * snapshots, rollups, pilotage des sessions de cuisson, injection d'events,
 * et endpoint de stream temps réel par device.
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur les routes admin (sauf /health)
 * - Le stream WebSocket est gardé par un token de session (namespace tokens),
 *   émis via POST /auth/session et invalidé explicitement au logout
 * - Rate limiting par appelant, compteurs à fenêtre dans le namespace rate
 */

use crate::alerts::AlertEvaluator;
use crate::cache::CacheHub;
use crate::config::KernelConfig;
use crate::models::{fmt_rfc3339, Channel, ConnectionStatus};
use crate::profiles::ProfileLibrary;
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::rollup::RollupSnapshot;
use crate::session::{EventKind, SessionManager, SessionView};
use crate::stream::StreamHub;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<KernelConfig>,
    pub cache: Arc<CacheHub>,
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionManager>,
    pub alerts: Arc<AlertEvaluator>,
    pub stream: Arc<StreamHub>,
    pub profiles: Arc<ProfileLibrary>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct DeviceView {
    device_id: String,
    name: String,
    channels: Vec<Channel>,
    battery: f32,
    signal: f32,
    connection_status: ConnectionStatus,
    last_seen: String,        // RFC3339 pour l'API
    stale: bool,              // true si plus vieux que le budget status
    stale_for_seconds: i64,
}

fn to_view(e: &DeviceEntry, now: OffsetDateTime, stale_after_secs: u64) -> DeviceView {
    let age = now - e.status.last_seen;
    DeviceView {
        device_id: e.device_id.clone(),
        name: e.name.clone(),
        channels: e.channels.clone(),
        battery: e.status.battery_pct,
        signal: e.status.signal_pct,
        connection_status: e.status.connection,
        last_seen: fmt_rfc3339(e.status.last_seen),
        stale: age > Duration::seconds(stale_after_secs as i64),
        stale_for_seconds: age.whole_seconds().max(0),
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // health toujours accessible; le stream est gardé par token, pas par api key
    if path.starts_with("/health") || path.ends_with("/stream") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("BRASERO_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        eprintln!("SECURITY: BRASERO_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Rate limiting par appelant : compteur monotone dans le namespace rate,
/// la fenêtre se referme toute seule (le TTL du compteur EST la fenêtre).
async fn rate_limit(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let caller = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anon")
        .to_string();
    let count = app.cache.rate.incr(&caller);
    if count > app.cfg.rate_limit.max_requests {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/auth/session", post(login).delete(logout))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/snapshot", get(get_snapshot))
        .route("/devices/{id}/rollups", get(get_rollups))
        .route("/devices/{id}/stream", get(stream_ws))
        .route(
            "/devices/{id}/channels/{ch}/session",
            post(post_session).delete(delete_session),
        )
        .route("/devices/{id}/channels/{ch}/events", post(post_event))
        .route("/sessions", get(get_sessions))
        .route("/alerts", get(get_alerts))
        .route("/profiles", get(get_profiles))
        .with_state(app_state.clone())
        .layer(middleware::from_fn(require_api_key))
        .layer(middleware::from_fn_with_state(app_state, rate_limit))
}

// ---------------------------------------------------------------------------
// Auth : émission et invalidation de tokens de session dashboard
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct TokenEntry {
    issued_at: String,
}

async fn login(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let token = Uuid::new_v4().to_string();
    app.cache.tokens.set_t(
        &token,
        &TokenEntry {
            issued_at: fmt_rfc3339(OffsetDateTime::now_utc()),
        },
    );
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "token": token,
            "expires_in_secs": app.cfg.cache.tokens_ttl_secs,
        })),
    )
}

// Invalidation explicite : la session disparaît du namespace tokens tout de suite.
async fn logout(State(app): State<AppState>, headers: HeaderMap) -> StatusCode {
    let Some(token) = headers.get("x-auth-token").and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    if app.cache.tokens.remove(token) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    let now = OffsetDateTime::now_utc();
    let stale_after = app.cfg.cache.status_ttl_secs;
    let list = app
        .registry
        .list()
        .await
        .iter()
        .map(|e| to_view(e, now, stale_after))
        .collect();
    Json(list)
}

async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(entry) = app.registry.get_device(&id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    let now = OffsetDateTime::now_utc();
    let view = to_view(&entry, now, app.cfg.cache.status_ttl_secs);
    let sessions: Vec<SessionView> = app
        .sessions
        .active()
        .into_iter()
        .filter(|s| s.device_id == id)
        .collect();
    Ok(Json(serde_json::json!({
        "device": view,
        "sessions": sessions,
    })))
}

async fn get_snapshot(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::DeviceSnapshot>, StatusCode> {
    app.stream
        .snapshot(&id, &app.registry, &app.alerts, OffsetDateTime::now_utc())
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_rollups(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HashMap<String, Option<RollupSnapshot>>>, StatusCode> {
    let Some(entry) = app.registry.get_device(&id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    let rollups = entry
        .channels
        .iter()
        .map(|ch| {
            (
                ch.channel_id.clone(),
                app.cache
                    .rollups
                    .get_t(&CacheHub::live_key(&id, &ch.channel_id)),
            )
        })
        .collect();
    Ok(Json(rollups))
}

// ---------------------------------------------------------------------------
// Sessions de cuisson et events
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SessionBody {
    profile: String,
}

async fn post_session(
    State(app): State<AppState>,
    Path((id, ch)): Path<(String, String)>,
    Json(body): Json<SessionBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(device) = app.registry.get_device(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown device"})),
        );
    };
    if !device.channels.iter().any(|c| c.channel_id == ch) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown channel"})),
        );
    }
    match app
        .sessions
        .start(&id, &ch, &body.profile, OffsetDateTime::now_utc())
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"status": "started", "profile": body.profile})),
        ),
        // profil inconnu/malformé : erreur de configuration, rejetée ici
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn delete_session(
    State(app): State<AppState>,
    Path((id, ch)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    // idempotent : stopper une session absente n'est pas une erreur
    let stopped = app.sessions.stop(&id, &ch);
    Json(serde_json::json!({"stopped": stopped}))
}

#[derive(Deserialize)]
struct EventBody {
    kind: EventKind,
    magnitude: Option<f64>,
    decay_secs: Option<f64>,
}

async fn post_event(
    State(app): State<AppState>,
    Path((id, ch)): Path<(String, String)>,
    Json(body): Json<EventBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let applied = app.sessions.inject_event(
        &id,
        &ch,
        body.kind,
        body.magnitude,
        body.decay_secs,
        OffsetDateTime::now_utc(),
    );
    if applied {
        (StatusCode::OK, Json(serde_json::json!({"applied": true})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"applied": false, "error": "no active session"})),
        )
    }
}

async fn get_sessions(State(app): State<AppState>) -> Json<Vec<SessionView>> {
    Json(app.sessions.active())
}

async fn get_alerts(State(app): State<AppState>) -> Json<Vec<crate::models::AlertNotification>> {
    Json(app.alerts.firing())
}

async fn get_profiles(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.profiles.names())
}

#[derive(Serialize)]
struct SystemHealth {
    uptime_seconds: u64,
    devices_tracked: usize,
    active_sessions: usize,
    subscribers: usize,
    live_entries: usize,
}

async fn get_system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    Json(SystemHealth {
        uptime_seconds: app.started_at.elapsed().as_secs(),
        devices_tracked: app.registry.list().await.len(),
        active_sessions: app.sessions.active().len(),
        subscribers: app.stream.subscriber_count(),
        live_entries: app.cache.live.len(),
    })
}

// ---------------------------------------------------------------------------
// Stream WebSocket
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AckIn {
    ack: u64,
}

async fn stream_ws(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(app): State<AppState>,
) -> Response {
    // token de session obligatoire (émis par POST /auth/session)
    let authorized = params
        .get("token")
        .map(|t| app.cache.tokens.get(t).is_some())
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| client_stream(socket, app, device_id))
}

async fn client_stream(mut socket: WebSocket, app: AppState, device_id: String) {
    let client_id = Uuid::new_v4().to_string();
    let now = OffsetDateTime::now_utc();
    let Some(mut sub) = app
        .stream
        .subscribe(&client_id, &device_id, &app.registry, &app.alerts, now)
        .await
    else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    // replay immédiat du snapshot : un client qui se (re)connecte repart
    // toujours d'un état complet, jamais plus vieux que le TTL live
    if let Ok(json) = serde_json::to_string(&sub.snapshot) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            app.stream.drop_subscription(&client_id);
            return;
        }
    }

    let idle_timeout =
        std::time::Duration::from_secs(app.cfg.stream.idle_timeout_secs.max(1));
    let mut last_activity = tokio::time::Instant::now();
    let mut idle_check = tokio::time::interval(idle_timeout.min(std::time::Duration::from_secs(10)));

    loop {
        tokio::select! {
            update = sub.rx.recv() => match update {
                Ok(u) => {
                    let Ok(json) = serde_json::to_string(&u) else { continue };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    app.stream.touch(&client_id);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // consommateur lent : les plus anciennes sont perdues,
                    // le producteur n'a jamais attendu
                    eprintln!("[stream] client {client_id} lagging, {n} updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(txt))) => {
                    last_activity = tokio::time::Instant::now();
                    if let Ok(ack) = serde_json::from_str::<AckIn>(txt.as_str()) {
                        app.stream.ack(&client_id, ack.ack);
                    }
                }
                Some(Ok(_)) => {
                    last_activity = tokio::time::Instant::now();
                }
            },
            _ = idle_check.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    println!("[stream] client {client_id} idle, closing");
                    break;
                }
            }
        }
    }
    app.stream.drop_subscription(&client_id);
}
