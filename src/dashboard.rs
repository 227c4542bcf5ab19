//! REST endpoints: ticket queries for the dashboard and push ingest for
//! inbound messages.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::mail::{InboundEmail, parse_inbound};
use crate::store::{TicketFilter, TicketStore};
use crate::ticket::Status;

/// Shared state for dashboard routes.
#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn TicketStore>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Query string for GET /api/tickets.
#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    from_day: Option<String>,
    to_day: Option<String>,
    status: Option<String>,
    subcategory: Option<String>,
    team: Option<String>,
    limit: Option<usize>,
}

/// JSON body for POST /api/messages.
#[derive(Debug, Deserialize)]
struct IngestMessage {
    thread_id: String,
    message_id: String,
    sender: String,
    #[serde(default)]
    subject: Option<String>,
    body: String,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": message.into()}))
}

/// GET /api/tickets
///
/// Lists tickets filtered by day range, status, subcategory and team.
async fn list_tickets(
    State(state): State<DashboardState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => {
            match serde_json::from_value::<Status>(serde_json::Value::String(raw.to_string())) {
                Ok(status) => Some(status),
                Err(_) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        error_body(format!("unknown status: {raw}")),
                    )
                        .into_response();
                }
            }
        }
    };

    let filter = TicketFilter {
        from_day: query.from_day,
        to_day: query.to_day,
        status,
        subcategory: query.subcategory,
        team: query.team,
        limit: query.limit.unwrap_or(0),
    };
    match state.store.list(&filter).await {
        Ok(tickets) => Json(tickets).into_response(),
        Err(e) => {
            warn!(error = %e, "Ticket listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response()
        }
    }
}

/// GET /api/tickets/{id}
///
/// Returns one ticket, or 404 if the id is unknown.
async fn get_ticket(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&id).await {
        Ok(Some(ticket)) => Json(ticket).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("no such ticket")).into_response(),
        Err(e) => {
            warn!(error = %e, id, "Ticket fetch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response()
        }
    }
}

/// POST /api/messages
///
/// Accepts one pre-parsed inbound message and queues it for processing.
/// Returns 202: processing is asynchronous and outcomes land in the store.
async fn ingest_message(
    State(state): State<DashboardState>,
    Json(message): Json<IngestMessage>,
) -> impl IntoResponse {
    let email = InboundEmail {
        thread_id: message.thread_id,
        message_id: message.message_id.clone(),
        sender: message.sender,
        subject: message.subject,
        body: message.body,
        received_at: Utc::now(),
    };
    submit(&state, email).await
}

/// POST /api/messages/raw
///
/// Accepts a raw RFC822 payload (relay pipe / webhook body) and queues it.
async fn ingest_raw(
    State(state): State<DashboardState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    match parse_inbound(&body) {
        Ok(email) => submit(&state, email).await,
        Err(e) => (StatusCode::BAD_REQUEST, error_body(e.to_string())).into_response(),
    }
}

async fn submit(state: &DashboardState, email: InboundEmail) -> axum::response::Response {
    let message_id = email.message_id.clone();
    match state.dispatcher.submit(email).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"accepted": true, "message_id": message_id})),
        )
            .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())).into_response(),
    }
}

/// Build the dashboard and ingest routes.
pub fn dashboard_routes(state: DashboardState) -> Router {
    Router::new()
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket))
        .route("/api/messages", post(ingest_message))
        .route("/api/messages/raw", post(ingest_raw))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
