//! External command ingestion over HTTP.
//!
//! A deliberately small surface: read the mirrored state, submit commands.
//! Commands land in the same bounded queue as knob events, so ordering
//! across sources is whatever order they were enqueued in. This is also
//! the only producer of absolute power targets; the knob can only toggle.

use crate::command::{CommandKind, CommandSubmitter};
use crate::state::{PowerTarget, StateModel};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::info;

#[derive(Clone)]
struct ApiContext {
    model: StateModel,
    submitter: CommandSubmitter,
}

/// Command payload, e.g. `{"action": "volume_step", "delta": -3}` or
/// `{"action": "power", "on": true}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum CommandRequest {
    VolumeStep { delta: i32 },
    Mute,
    Dim,
    PowerToggle,
    Power { on: bool },
}

impl CommandRequest {
    fn into_kind(self) -> CommandKind {
        match self {
            CommandRequest::VolumeStep { delta } => CommandKind::VolumeStep(delta),
            CommandRequest::Mute => CommandKind::MuteToggle,
            CommandRequest::Dim => CommandKind::DimToggle,
            CommandRequest::PowerToggle => CommandKind::PowerToggle,
            CommandRequest::Power { on } => CommandKind::PowerSet(if on {
                PowerTarget::On
            } else {
                PowerTarget::Off
            }),
        }
    }
}

pub fn router(model: StateModel, submitter: CommandSubmitter) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/command", post(post_command))
        .with_state(ApiContext { model, submitter })
}

async fn get_state(State(ctx): State<ApiContext>) -> Json<Value> {
    let s = ctx.model.snapshot();
    Json(json!({
        "power": s.power,
        "muted": s.muted,
        "dimmed": s.dimmed,
        "volume": s.volume,
        "volume_db": s.volume as i32 - 127,
    }))
}

async fn post_command(
    State(ctx): State<ApiContext>,
    Json(request): Json<CommandRequest>,
) -> (StatusCode, Json<Value>) {
    let kind = request.into_kind();
    match ctx.submitter.submit(kind).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"queued": true}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"queued": false, "error": e.to_string()})),
        ),
    }
}

/// Serve until the task is aborted.
pub async fn serve(port: u16, model: StateModel, submitter: CommandSubmitter) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    info!("API listening on http://{addr}");
    axum::serve(listener, router(model, submitter))
        .await
        .context("API server exited")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_payloads_deserialize() {
        let r: CommandRequest =
            serde_json::from_str(r#"{"action": "volume_step", "delta": -3}"#).unwrap();
        assert!(matches!(r.into_kind(), CommandKind::VolumeStep(-3)));

        let r: CommandRequest = serde_json::from_str(r#"{"action": "power", "on": false}"#).unwrap();
        assert!(matches!(
            r.into_kind(),
            CommandKind::PowerSet(PowerTarget::Off)
        ));

        let r: CommandRequest = serde_json::from_str(r#"{"action": "mute"}"#).unwrap();
        assert!(matches!(r.into_kind(), CommandKind::MuteToggle));

        assert!(serde_json::from_str::<CommandRequest>(r#"{"action": "reboot"}"#).is_err());
    }
}
