//! HTTP API for the announcer.
//!
//! Runs on port 5000 by default. CORS-permissive so the operator page can be
//! served from anywhere on the LAN. Every slot with a fixed file also gets a
//! `POST /play_<slot>` route, registered from the config at startup.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use kart_core::types::{AudioFormat, PlaybackStatus, Source};

use crate::announcer::Announcer;
use crate::cache::CacheStats;
use crate::config::{AppConfig, SlotConfig};
use crate::error::{AnnounceError, CacheError, ClaimError, ConfigError};
use crate::gpio::CONFIG_POLL;

#[derive(Clone)]
struct AppState {
    announcer: Announcer,
    started: Instant,
}

/// Build the axum router around a shared [`Announcer`].
pub fn router(announcer: Announcer) -> Router {
    let fixed = announcer.config().snapshot().fixed_slots();
    let mut router = Router::new()
        .route("/play_instant", post(play_instant))
        .route("/slots/{slot}/play", post(play_slot))
        .route("/announcement_status", get(announcement_status))
        .route("/config", get(get_config))
        .route("/save_config", post(save_config))
        .route("/cache_status", get(cache_status))
        .route("/clear_cache", post(clear_cache))
        .route("/reset_locks", post(reset_locks))
        .route("/check_dependencies", get(check_dependencies))
        .route("/health", get(health));

    for slot in fixed {
        if slot == "instant" {
            warn!("server: slot 'instant' clashes with /play_instant; use /slots/instant/play");
            continue;
        }
        let name = slot.clone();
        router = router.route(
            &format!("/play_{slot}"),
            post(move |State(state): State<AppState>| {
                let slot = name.clone();
                async move { play_named(&state, slot).await }
            }),
        );
    }

    router.layer(CorsLayer::permissive()).with_state(AppState {
        announcer,
        started: Instant::now(),
    })
}

/// Serve until `shutdown` resolves. Warms the cache and watches the config
/// file in the background.
pub async fn serve(
    announcer: Announcer,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let settings = announcer.config().snapshot().server;
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    info!("server: listening on {}", listener.local_addr()?);

    let warm = announcer.clone();
    tokio::spawn(async move {
        warm.warm().await;
        let mut reload = tokio::time::interval(CONFIG_POLL);
        reload.tick().await;
        loop {
            reload.tick().await;
            if let Err(e) = warm.reload_config().await {
                error!("config: reload failed, keeping previous: {e}");
            }
        }
    });

    axum::serve(listener, router(announcer))
        .with_graceful_shutdown(shutdown)
        .await
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Everything a handler can fail with, mapped to a status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Announce(#[from] AnnounceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Claim(#[from] ClaimError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    seconds_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_seconds: Option<f64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut timing = (None, None);
        let status = match &self {
            ApiError::Announce(e) => match e {
                AnnounceError::AlreadyPlaying {
                    elapsed_secs,
                    seconds_remaining,
                    ..
                } => {
                    timing = (Some(*seconds_remaining), Some(*elapsed_secs));
                    StatusCode::TOO_MANY_REQUESTS
                }
                AnnounceError::EmptyText => StatusCode::BAD_REQUEST,
                AnnounceError::UnknownSlot(_) | AnnounceError::FileMissing(_) => {
                    StatusCode::NOT_FOUND
                }
                AnnounceError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
                AnnounceError::SynthesisUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                AnnounceError::Cache(_)
                | AnnounceError::Claim(_)
                | AnnounceError::Playback(_)
                | AnnounceError::Task(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Config(ConfigError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ApiError::Cache(CacheError::Configuration(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Cache(CacheError::SynthesisFailed(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Config(_) | ApiError::Cache(_) | ApiError::Claim(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("server: {self}");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            seconds_remaining: timing.0,
            elapsed_seconds: timing.1,
        });
        (status, body).into_response()
    }
}

// ─── Playback ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PlayInstantRequest {
    text: String,
}

async fn play_instant(
    State(state): State<AppState>,
    Json(req): Json<PlayInstantRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .announcer
        .announce_text(Source::Web("instant".into()), &req.text)
        .await?;
    Ok(Json(json!({})))
}

async fn play_slot(
    State(state): State<AppState>,
    Path(slot): Path<String>,
) -> Result<Json<Value>, ApiError> {
    play_named(&state, slot).await
}

async fn play_named(state: &AppState, slot: String) -> Result<Json<Value>, ApiError> {
    state
        .announcer
        .announce_slot(Source::Web(slot.clone()), &slot)
        .await?;
    Ok(Json(json!({})))
}

async fn announcement_status(
    State(state): State<AppState>,
) -> Result<Json<PlaybackStatus>, ApiError> {
    Ok(Json(state.announcer.status().await?))
}

// ─── Config ────────────────────────────────────────────────────────────────

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.announcer.config().snapshot())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigUpdate {
    voice_id: Option<String>,
    output_format: Option<AudioFormat>,
    /// Slot name to new text. Unknown names create text slots.
    slots: BTreeMap<String, String>,
}

async fn save_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<AppConfig>, ApiError> {
    let saved = state.announcer.config().update(|config| {
        if let Some(voice) = update.voice_id {
            config.tts.voice_id = voice;
        }
        if let Some(format) = update.output_format {
            config.tts.output_format = format;
        }
        for (name, text) in update.slots {
            let slot = config.slots.entry(name).or_insert_with(SlotConfig::default);
            slot.text = Some(text);
        }
    })?;
    info!("config: saved via API");
    spawn_warm(&state.announcer);
    Ok(Json(saved))
}

// ─── Cache & maintenance ───────────────────────────────────────────────────

async fn cache_status(State(state): State<AppState>) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.announcer.cache().stats().await?))
}

#[derive(Serialize)]
struct ClearResponse {
    removed: usize,
}

async fn clear_cache(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.announcer.cache().clear().await?;
    spawn_warm(&state.announcer);
    Ok(Json(ClearResponse { removed }))
}

#[derive(Serialize)]
struct ResetResponse {
    cleared: bool,
    holder: Option<String>,
}

async fn reset_locks(State(state): State<AppState>) -> Result<Json<ResetResponse>, ApiError> {
    let cleared = state.announcer.coordinator().reset().await?;
    Ok(Json(ResetResponse {
        cleared: cleared.is_some(),
        holder: cleared.map(|c| c.holder),
    }))
}

#[derive(Serialize)]
struct DependencyReport {
    audio_output: bool,
    synthesizer: bool,
}

async fn check_dependencies(State(state): State<AppState>) -> Json<DependencyReport> {
    Json(DependencyReport {
        audio_output: state.announcer.player().is_available(),
        synthesizer: state.announcer.cache().synthesizer().is_reachable().await,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

fn spawn_warm(announcer: &Announcer) {
    let announcer = announcer.clone();
    tokio::spawn(async move {
        announcer.warm().await;
    });
}
