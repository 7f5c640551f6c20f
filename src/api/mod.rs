//! HTTP surface: QIDO-RS/WADO-RS handlers plus the small operational endpoints
//! (`/ping`, `/status`, `/dimse/echo`).

pub mod common;
pub mod qido;
pub mod wado;

use std::time::Instant;

use axum::extract::State;
use axum::http::Method;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;

pub use common::AppState;

use crate::config::CorsConfig;
use crate::error::GatewayError;

pub fn routes(state: AppState) -> Router {
	let cors = cors_layer(&state.config.cors);

	Router::new()
		.route("/ping", get(ping))
		.route("/status", get(status))
		.route("/dimse/echo", post(dimse_echo))
		.route("/studies", get(qido::studies))
		.route("/studies/{study}", get(wado::study))
		.route("/studies/{study}/series", get(qido::series))
		.route("/studies/{study}/series/{series}", get(wado::series))
		.route("/studies/{study}/series/{series}/instances", get(qido::instances))
		.route("/studies/{study}/series/{series}/instances/{instance}", get(wado::instance))
		.layer(cors)
		.with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
	let origin = if config.origin == "*" {
		AllowOrigin::any()
	} else {
		AllowOrigin::exact(config.origin.parse().expect("configured CORS origin must be a valid header value"))
	};

	let methods: Vec<Method> = config
		.methods
		.iter()
		.filter_map(|m| m.parse().ok())
		.collect();
	let headers: Vec<_> = config
		.allowed_headers
		.iter()
		.filter_map(|h| h.parse().ok())
		.collect();

	let mut layer = CorsLayer::new().allow_origin(origin).allow_methods(methods).allow_headers(headers);
	if config.credentials {
		layer = layer.allow_credentials(true);
	}
	layer
}

async fn ping() -> &'static str {
	"pong"
}

#[derive(Debug, Serialize)]
struct StatusBody {
	status: &'static str,
	#[serde(rename = "pendingMoves")]
	pending_moves: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
	Json(StatusBody {
		status: "ok",
		pending_moves: state.tracker.pending_count(),
	})
}

#[derive(Debug, Deserialize)]
struct EchoRequest {
	#[serde(rename = "peerIndex")]
	peer_index: usize,
}

#[derive(Debug, Serialize)]
struct EchoResponse {
	success: bool,
	peer: String,
	#[serde(rename = "responseTime")]
	response_time_ms: u128,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

/// `peers[0]` is the only association this gateway ever opens (see
/// [`crate::config::DimseProxySettings::primary_peer`]); `peerIndex` is accepted and echoed back
/// for DICOMweb-gateway API compatibility but does not change which peer is contacted.
#[instrument(skip(state))]
async fn dimse_echo(State(state): State<AppState>, Json(request): Json<EchoRequest>) -> Result<Json<EchoResponse>, GatewayError> {
	let peer = state
		.config
		.dimse_proxy_settings
		.peers
		.get(request.peer_index)
		.or_else(|| state.config.dimse_proxy_settings.primary_peer())
		.map(|p| p.aet.clone())
		.unwrap_or_default();

	let started = Instant::now();
	let result = state.scu.echo().await;
	let response_time_ms = started.elapsed().as_millis();

	Ok(Json(match result {
		Ok(success) => EchoResponse {
			success,
			peer,
			response_time_ms,
			error: None,
		},
		Err(err) => EchoResponse {
			success: false,
			peer,
			response_time_ms,
			error: Some(err.to_string()),
		},
	}))
}
