use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::error;
use uuid::Uuid;

use crate::db::PgStore;
use crate::delivery::{DeliveryService, MultiSendReport};
use crate::generator::NotificationGenerator;
use crate::history::HistoryService;
use crate::metrics;
use crate::models::{
    ActionTaken, HistoryStats, NotificationHistory, NotificationType, Priority, PushPayload,
};
use crate::provider::Provider;
use crate::scheduler::{LocalScheduler, TokioTimerPlatform};
use crate::store::{EndpointRegistry, VehicleSource};

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_CONCURRENT_REQUESTS: usize = 256;

pub type Delivery = DeliveryService<PgStore, PgStore, PgStore, Provider>;
pub type Scheduler = LocalScheduler<PgStore, PgStore, TokioTimerPlatform>;

// Request and response models
#[derive(Deserialize)]
struct HistoryQuery {
    user_id: Uuid,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Uuid,
}

#[derive(Deserialize)]
struct ActionRequest {
    user_id: Uuid,
    id: Uuid,
    action: ActionTaken,
}

#[derive(Deserialize)]
struct CancelRequest {
    user_id: Uuid,
    id: Uuid,
}

#[derive(Serialize)]
struct UpdatedResponse {
    updated: bool,
}

#[derive(Deserialize)]
struct GenerateRequest {
    user_id: Uuid,
}

#[derive(Serialize)]
struct GenerateResponse {
    generated: usize,
    scheduled: Vec<String>,
}

#[derive(Deserialize)]
struct SendRequest {
    user_ids: Vec<Uuid>,
    title: String,
    body: String,
    #[serde(default)]
    data: HashMap<String, String>,
    notification_type: Option<NotificationType>,
    priority: Option<Priority>,
    #[serde(default)]
    emergency: bool,
}

#[derive(Deserialize)]
struct BroadcastRequest {
    title: String,
    body: String,
    #[serde(default)]
    data: HashMap<String, String>,
    notification_type: Option<NotificationType>,
}

#[derive(Deserialize)]
struct RegisterTokenRequest {
    user_id: Uuid,
    token: String,
}

#[derive(Deserialize)]
struct CleanupRequest {
    days_old: Option<i64>,
}

#[derive(Serialize)]
struct CleanupResponse {
    deactivated: u64,
}

// API state
pub struct ApiState {
    pub store: Arc<PgStore>,
    pub generator: NotificationGenerator<PgStore, PgStore>,
    pub scheduler: Arc<Scheduler>,
    pub delivery: Arc<Delivery>,
    pub history: HistoryService<PgStore>,
    pub token_max_idle_days: i64,
}

impl ApiState {
    /// Generates the user's pending reminders and arms a local timer for each new one.
    pub async fn refresh_reminders(&self, user_id: Uuid) -> anyhow::Result<GenerateOutcome> {
        let vehicles = self.store.vehicles_for_user(user_id).await?;
        let notifications = self.generator.generate(user_id, &vehicles).await;

        let mut scheduled = Vec::with_capacity(notifications.len());
        for notification in &notifications {
            if let Some(handle) = self.scheduler.schedule_generated(notification).await.id {
                scheduled.push(handle);
            }
        }

        Ok(GenerateOutcome {
            generated: notifications.len(),
            scheduled,
        })
    }
}

pub struct GenerateOutcome {
    pub generated: usize,
    pub scheduled: Vec<String>,
}

// Set up API router
pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/history", get(get_history))
        .route("/history/stats", get(get_stats))
        .route("/history/action", post(mark_action))
        .route("/history/cancel", post(cancel_notification))
        .route("/reminders/generate", post(generate_reminders))
        .route("/push/send", post(send_push))
        .route("/push/broadcast", post(broadcast_push))
        .route("/tokens/register", post(register_token))
        .route("/tokens/cleanup", post(cleanup_tokens))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive()) // For development - restrict in production
}

fn internal_error(context: &str, e: anyhow::Error) -> StatusCode {
    error!("{}: {:#}", context, e);
    StatusCode::INTERNAL_SERVER_ERROR
}

// API handlers
async fn get_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<NotificationHistory>>, StatusCode> {
    state
        .history
        .get_history(query.user_id, query.limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("Error loading history", e))
}

async fn get_stats(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<HistoryStats>, StatusCode> {
    state
        .history
        .get_stats(query.user_id)
        .await
        .map(Json)
        .map_err(|e| internal_error("Error computing history stats", e))
}

async fn mark_action(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<UpdatedResponse>, StatusCode> {
    let updated = state
        .history
        .mark_notification_action(req.user_id, req.id, req.action)
        .await
        .map_err(|e| internal_error("Error marking notification action", e))?;

    if !updated {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(UpdatedResponse { updated }))
}

async fn cancel_notification(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<UpdatedResponse>, StatusCode> {
    let updated = state
        .scheduler
        .cancel_notification(req.user_id, req.id)
        .await
        .map_err(|e| internal_error("Error cancelling notification", e))?;

    Ok(Json(UpdatedResponse { updated }))
}

async fn generate_reminders(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, StatusCode> {
    let outcome = state
        .refresh_reminders(req.user_id)
        .await
        .map_err(|e| internal_error("Error generating reminders", e))?;

    Ok(Json(GenerateResponse {
        generated: outcome.generated,
        scheduled: outcome.scheduled,
    }))
}

async fn send_push(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<MultiSendReport>, StatusCode> {
    if req.user_ids.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let payload = PushPayload {
        title: req.title,
        body: req.body,
        data: req.data,
        priority: req.priority,
        ..Default::default()
    };

    let report = if req.emergency {
        state
            .delivery
            .send_emergency_notification(&req.user_ids, &payload)
            .await
    } else {
        state
            .delivery
            .send_to_multiple_users(&req.user_ids, &payload, req.notification_type)
            .await
    };
    Ok(Json(report))
}

async fn broadcast_push(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BroadcastRequest>,
) -> Json<MultiSendReport> {
    let payload = PushPayload {
        title: req.title,
        body: req.body,
        data: req.data,
        ..Default::default()
    };
    Json(
        state
            .delivery
            .broadcast_to_all_users(&payload, req.notification_type)
            .await,
    )
}

async fn register_token(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterTokenRequest>,
) -> StatusCode {
    match state.store.register_token(req.user_id, &req.token).await {
        Ok(token) if token.is_active => StatusCode::CREATED,
        // Deactivated endpoints stay dead until the device issues a new token
        Ok(_) => StatusCode::GONE,
        Err(e) => internal_error("Error registering push token", e),
    }
}

async fn cleanup_tokens(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, StatusCode> {
    let days_old = req.days_old.unwrap_or(state.token_max_idle_days);
    if days_old < 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let deactivated = state
        .delivery
        .cleanup_old_tokens(days_old)
        .await
        .map_err(|e| internal_error("Error cleaning up push tokens", e))?;
    Ok(Json(CleanupResponse { deactivated }))
}

async fn metrics_endpoint() -> String {
    metrics::metrics_handler()
}
