//! # Control Plane
//!
//! Local HTTP API used by the viewer page and by scripts.
//!
//! ## Endpoints
//!
//! | Path | Method | Description |
//! |------|--------|-------------|
//! | `/config` | GET | Current `{remote_port}` |
//! | `/config` | POST | Persist a new remote port and restart the tunnel |
//! | `/list` | GET | Every stored clip as `[{name, folder}]` |
//! | `/load` | POST | Broadcast a stored clip |
//! | `/motion` | POST | Broadcast a clip from a path or an inline payload |
//! | `/save` | POST | Copy a generated clip into `saved/` |
//! | `/clear` | POST | Delete generated clips |
//! | `/generate` | POST | Start a text-to-motion run (202) |
//!
//! Handlers never touch hub or generation state directly: publishes go through
//! the [`HubHandle`] channel and submissions through the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::broadcasting::{HubHandle, ViewerMessage};
use crate::error::{BridgeError, BridgeResult};
use crate::generation::{GenerationOrchestrator, Submission};
use crate::library::{ArtifactEntry, ArtifactLibrary, Folder};
use crate::motion::{ClipConverter, WebClip};
use crate::tunnel::TunnelSupervisor;

/// Everything the handlers share.
#[derive(Clone)]
pub struct ControlState {
    pub hub: HubHandle,
    pub orchestrator: GenerationOrchestrator,
    pub library: ArtifactLibrary,
    pub converter: Arc<ClipConverter>,
    pub tunnel: Arc<TunnelSupervisor>,
}

/// Builds the control-plane router.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/config", get(get_config).post(set_config).options(preflight))
        .route("/list", get(list_artifacts).options(preflight))
        .route("/load", post(load_artifact).options(preflight))
        .route("/motion", post(push_motion).options(preflight))
        .route("/save", post(save_artifact).options(preflight))
        .route("/clear", post(clear_generated).options(preflight))
        .route("/generate", post(generate).options(preflight))
        .fallback(fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers([header::CONTENT_TYPE])
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS]),
        )
        .with_state(state)
}

/// Serves the control plane on an already bound listener.
pub async fn serve_control(listener: TcpListener, state: ControlState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP  http://{}  (/load /motion /save /clear /generate /config)", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, "not found").into_response()
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> BridgeResult<T> {
    serde_json::from_slice(body).map_err(|_| BridgeError::Validation("invalid json".to_string()))
}

/// Reads a JSON number or a numeric string.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Configuration
// ============================================================================

async fn get_config(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({ "remote_port": state.tunnel.remote_port() }))
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    #[serde(default)]
    remote_port: Option<Value>,
}

/// Accepts integers, integral floats and integer strings.
fn parse_port(value: &Value) -> BridgeResult<i64> {
    let port = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    port.ok_or_else(|| BridgeError::Validation("remote_port must be integer".to_string()))
}

async fn set_config(State(state): State<ControlState>, body: Bytes) -> BridgeResult<Json<Value>> {
    let body: ConfigBody = parse_body(&body)?;
    let port = match body.remote_port {
        None | Some(Value::Null) => {
            return Err(BridgeError::Validation("remote_port required".to_string()));
        }
        Some(value) => parse_port(&value)?,
    };

    // Restarting the tunnel sleeps through its grace period.
    let tunnel = Arc::clone(&state.tunnel);
    let port = tokio::task::spawn_blocking(move || tunnel.reconfigure(port))
        .await
        .map_err(|e| BridgeError::Io(std::io::Error::other(e)))??;

    Ok(Json(json!({ "remote_port": port })))
}

// ============================================================================
// Library
// ============================================================================

async fn list_artifacts(State(state): State<ControlState>) -> Json<Vec<ArtifactEntry>> {
    Json(state.library.list())
}

#[derive(Debug, Deserialize)]
struct LoadBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    folder: Option<String>,
}

async fn load_artifact(State(state): State<ControlState>, body: Bytes) -> BridgeResult<&'static str> {
    let body: LoadBody = parse_body(&body)?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(BridgeError::Validation("name required".to_string()));
    }
    let folder = Folder::from_tag(body.folder.as_deref());

    let clip = state.library.load(folder, name, &state.converter)?;
    state
        .hub
        .publish(ViewerMessage::motion(format!("[LOAD] {}", name), clip.to_web_clip(), None));
    info!(folder = folder.dir_name(), name, frames = clip.frame_count(), "Loaded clip via /load");
    Ok("ok")
}

#[derive(Debug, Deserialize)]
struct MotionBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    clip: Option<Value>,
}

async fn push_motion(State(state): State<ControlState>, body: Bytes) -> BridgeResult<&'static str> {
    let body: MotionBody = parse_body(&body)?;
    let name = body.name.unwrap_or_else(|| "generated".to_string());

    let clip = match (body.path, body.clip) {
        (Some(path), _) => state.converter.load_file(&path)?.to_web_clip(),
        (None, Some(raw)) => {
            let clip: WebClip = serde_json::from_value(raw)
                .map_err(|e| BridgeError::Validation(format!("invalid clip: {}", e)))?;
            clip.check_shape()
                .map_err(|e| BridgeError::Validation(format!("invalid clip: {}", e)))?;
            clip
        }
        (None, None) => return Err(BridgeError::Validation("need 'path' or 'clip'".to_string())),
    };

    info!(name = %name, frames = clip.joint_pos.len(), "Pushing motion via /motion");
    state.hub.publish(ViewerMessage::motion(name, clip, None));
    Ok("ok")
}

#[derive(Debug, Deserialize)]
struct SaveBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    overwrite: bool,
}

async fn save_artifact(State(state): State<ControlState>, body: Bytes) -> BridgeResult<Json<Value>> {
    let body: SaveBody = parse_body(&body)?;
    let saved = state.library.save(&body.name, &body.source, body.overwrite)?;
    Ok(Json(json!({ "saved": saved })))
}

async fn clear_generated(State(state): State<ControlState>) -> Json<Value> {
    let deleted = state.library.clear_generated();
    Json(json!({ "deleted": deleted }))
}

// ============================================================================
// Generation
// ============================================================================

const DEFAULT_LENGTH_SECS: f64 = 4.0;
const DEFAULT_STEPS: u32 = 10;

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    length: Option<Value>,
    #[serde(default)]
    steps: Option<Value>,
}

async fn generate(State(state): State<ControlState>, body: Bytes) -> BridgeResult<Response> {
    let body: GenerateBody = parse_body(&body)?;
    let text = body.text.trim();
    if text.is_empty() {
        return Err(BridgeError::Validation("text required".to_string()));
    }

    let length = match body.length.as_ref().filter(|v| !v.is_null()) {
        None => DEFAULT_LENGTH_SECS,
        Some(value) => numeric(value)
            .filter(|l| l.is_finite() && *l > 0.0)
            .ok_or_else(|| BridgeError::Validation("length must be a positive number".to_string()))?,
    };
    let steps = match body.steps.as_ref().filter(|v| !v.is_null()) {
        None => DEFAULT_STEPS,
        Some(value) => numeric(value)
            .filter(|s| s.is_finite() && *s >= 1.0 && *s <= u32::MAX as f64)
            .map(|s| s as u32)
            .ok_or_else(|| BridgeError::Validation("steps must be a positive integer".to_string()))?,
    };

    match state.orchestrator.submit(text, length, steps) {
        Submission::Accepted => {
            info!(text, length, steps, "Generation accepted");
            Ok((StatusCode::ACCEPTED, "accepted").into_response())
        }
        Submission::Busy => Err(BridgeError::Conflict("already generating".to_string())),
        Submission::Unavailable => {
            warn!("Generation request dropped, dispatcher unavailable");
            Ok((StatusCode::SERVICE_UNAVAILABLE, "generation unavailable").into_response())
        }
    }
}
