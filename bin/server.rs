// Vehicle Identity Resolution Engine - Web Server
// REST surface for the admin review tooling: validate identifiers, inspect
// duplicate candidates, and drive manual merges and rehydrations.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use vehicle_identity::{
    execute_rehydration, plan_rehydration, validate_vin, CandidateMatcher, EngineError,
    MatchCandidate, MatchType, MergeExecutor, RehydrationPlan, RehydrationResult, VinValidation,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Map engine rejections to HTTP statuses; everything else is a 500.
fn error_status(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
        Some(EngineError::VehicleNotFound(_)) | Some(EngineError::MergeEventNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        Some(EngineError::MergeEventMismatch { .. }) => StatusCode::CONFLICT,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/vin/:vin - Validate an identifier
async fn validate_identifier(Path(vin): Path<String>) -> impl IntoResponse {
    Json(ApiResponse::<VinValidation>::ok(validate_vin(&vin)))
}

/// GET /api/vehicles/:id/duplicates - Read-only duplicate candidates
async fn find_duplicates(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match CandidateMatcher::new().find_duplicates_by_id(&conn, &vehicle_id) {
        Ok(matches) => {
            (StatusCode::OK, Json(ApiResponse::<Vec<MatchCandidate>>::ok(matches))).into_response()
        }
        Err(e) => {
            eprintln!("Error finding duplicates for {}: {}", vehicle_id, e);
            (
                error_status(&e),
                Json(ApiResponse::<Vec<MatchCandidate>>::err(e.to_string())),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct MergeRequest {
    survivor_id: String,
    absorbed_id: String,
    match_type: String,
    confidence: f64,
    actor_id: String,
}

#[derive(Serialize)]
struct MergeResponse {
    merged: bool,
}

/// POST /api/merge - Manual consolidation by an authorized operator
async fn manual_merge(
    State(state): State<AppState>,
    Json(req): Json<MergeRequest>,
) -> impl IntoResponse {
    let match_type = match MatchType::parse(&req.match_type) {
        Some(t) => t,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<MergeResponse>::err(format!(
                    "unknown match_type: {}",
                    req.match_type
                ))),
            )
                .into_response();
        }
    };

    let mut conn = state.db.lock().unwrap();

    match MergeExecutor::new().auto_merge(
        &mut conn,
        &req.survivor_id,
        &req.absorbed_id,
        match_type,
        req.confidence,
        &req.actor_id,
    ) {
        Ok(merged) => {
            (StatusCode::OK, Json(ApiResponse::ok(MergeResponse { merged }))).into_response()
        }
        Err(e) => {
            eprintln!("Error merging {} into {}: {}", req.absorbed_id, req.survivor_id, e);
            (
                error_status(&e),
                Json(ApiResponse::<MergeResponse>::err(e.to_string())),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct RehydrateRequest {
    survivor_id: String,
    merge_event_id: String,
    #[serde(default)]
    execute: bool,
    actor_id: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RehydrateResponse {
    Plan(RehydrationPlan),
    Result(RehydrationResult),
}

/// POST /api/rehydrate - Plan (default) or execute a merge reversal
async fn rehydrate(
    State(state): State<AppState>,
    Json(req): Json<RehydrateRequest>,
) -> impl IntoResponse {
    let mut conn = state.db.lock().unwrap();

    let result = if req.execute {
        execute_rehydration(&mut conn, &req.survivor_id, &req.merge_event_id, &req.actor_id)
            .map(RehydrateResponse::Result)
    } else {
        plan_rehydration(&conn, &req.survivor_id, &req.merge_event_id, &req.actor_id)
            .map(RehydrateResponse::Plan)
    };

    match result {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::ok(response))).into_response(),
        Err(e) => {
            eprintln!("Error rehydrating {}: {}", req.survivor_id, e);
            (
                error_status(&e),
                Json(ApiResponse::<RehydrateResponse>::err(e.to_string())),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    println!("🌐 Vehicle Identity Resolution Engine - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db_path = std::env::var("VEHICLE_DB").unwrap_or_else(|_| "vehicles.db".to_string());
    let conn = Connection::open(&db_path).expect("Failed to open database");
    vehicle_identity::setup_database(&conn).expect("Failed to initialize schema");
    println!("✓ Database opened: {}", db_path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/vin/:vin", get(validate_identifier))
        .route("/vehicles/:id/duplicates", get(find_duplicates))
        .route("/merge", post(manual_merge))
        .route("/rehydrate", post(rehydrate))
        .with_state(state.clone());

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://localhost:3000");
    println!("   Try: http://localhost:3000/api/health");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
