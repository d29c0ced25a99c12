//! JSON-over-HTTP surface.
//!
//! Every handler answers 200 with a JSON body. Failures are carried in an
//! `error` field next to the sentinel values, never as a dropped request.

use crate::embedding::EnrolledEmbedding;
use crate::error::Error;
use crate::matcher::MatchResult;
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

/// Matched user id, or `-1` when nothing was accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UserRef {
    Matched(String),
    Unmatched(i64),
}

pub const NO_USER: UserRef = UserRef::Unmatched(-1);

/// Image either by received artifact id or as hex-encoded bytes.
#[derive(Debug, Default, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub img_id: Option<String>,
    #[serde(default)]
    pub img_hex: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub img_id: String,
    pub exists: bool,
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub user_id: UserRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status/{img_id}", get(status))
        .route("/verify", post(verify))
        .route("/add", post(add))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(img_id): Path<String>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        exists: state.artifacts.exists(&img_id),
        verified: state.tracker.outcomes().is_verified(&img_id),
        img_id,
    })
}

pub async fn verify(
    State(state): State<AppState>,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Json<VerifyResponse> {
    let result = match request(payload) {
        Ok(req) => verify_request(&state, req).await,
        Err(e) => Err(e),
    };

    Json(match result {
        Ok(m) => VerifyResponse {
            user_id: m.best_user_id.map(UserRef::Matched).unwrap_or(NO_USER),
            score: Some(m.score),
            error: None,
        },
        Err(e) => {
            warn!("verify failed: {e}");
            VerifyResponse {
                user_id: NO_USER,
                score: None,
                error: Some(e.to_string()),
            }
        }
    })
}

async fn verify_request(state: &AppState, req: ImageRequest) -> Result<MatchResult, Error> {
    match (req.img_hex.as_deref(), req.img_id.as_deref()) {
        (Some(hex), _) => match decode_hex(hex) {
            Ok(bytes) => state.matcher.match_image(&bytes).await,
            Err(e) => Err(e),
        },
        (None, Some(id)) => state.matcher.match_artifact(id).await,
        (None, None) => Err(Error::InvalidImage),
    }
}

pub async fn add(
    State(state): State<AppState>,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Json<AddResponse> {
    let result = match request(payload) {
        Ok(req) => add_request(&state, req).await,
        Err(e) => Err(e),
    };

    Json(match result {
        Ok(record) => {
            info!("added user {}", record.user_id);
            AddResponse {
                success: true,
                user_id: Some(record.user_id),
                error: None,
            }
        }
        Err(e) => {
            warn!("add failed: {e}");
            AddResponse {
                success: false,
                user_id: None,
                error: Some(e.to_string()),
            }
        }
    })
}

async fn add_request(state: &AppState, req: ImageRequest) -> Result<EnrolledEmbedding, Error> {
    match (req.img_hex.as_deref(), req.img_id.as_deref()) {
        (Some(hex), _) => match decode_hex(hex) {
            Ok(bytes) => state.enroller.enroll(&bytes).await,
            Err(e) => Err(e),
        },
        // older callers put hex image bytes in `img_id`
        (None, Some(id)) if state.artifacts.exists(id) => state.enroller.enroll_artifact(id).await,
        (None, Some(legacy_hex)) => match decode_hex(legacy_hex) {
            Ok(bytes) => state.enroller.enroll(&bytes).await,
            Err(e) => Err(e),
        },
        (None, None) => Err(Error::InvalidImage),
    }
}

/// A rejected body is reported in the response like any other failure.
fn request(payload: Result<Json<ImageRequest>, JsonRejection>) -> Result<ImageRequest, Error> {
    payload
        .map(|Json(req)| req)
        .map_err(|rejection| Error::BadRequest(rejection.body_text()))
}

/// Hex image bytes; whitespace and line breaks are tolerated.
fn decode_hex(text: &str) -> Result<Vec<u8>, Error> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).map_err(|_| Error::InvalidImage)
}
