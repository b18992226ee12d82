use std::collections::HashMap;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use flowgate_core::prelude::*;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{OutboundOption, parse_outbound, parse_rules};
use crate::group::GroupCommonOption;
use crate::inbound::{InboundManager, InboundOption};
use crate::resolve::GeoIpLookup;
use crate::telemetry::log::{LogBroadcast, level_rank};
use crate::tunnel::Tunnel;

/// Everything the management handlers reach into.
pub struct AdminState {
	pub tunnel: Arc<Tunnel>,
	pub inbounds: Arc<InboundManager>,
	pub logs: LogBroadcast,
	pub geoip: Arc<dyn GeoIpLookup>,
	pub registry: Registry,
	pub secret: Option<String>,
}

#[derive(Serialize)]
struct ApiError {
	error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
	(
		StatusCode::BAD_REQUEST,
		Json(ApiError {
			error: message.into(),
		}),
	)
		.into_response()
}

/// Binds the management listener and serves until the process exits.
/// CORS is wide open: this is a management surface meant for local UIs.
pub async fn serve(addr: &str, state: Arc<AdminState>) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("bind management api {addr}"))?;
	info!(addr = %listener.local_addr()?, "management api listening");

	let cors = CorsLayer::new()
		.allow_origin(Any)
		.allow_methods(Any)
		.allow_headers(Any);

	let router = Router::new()
		.route("/", get(hello))
		.route("/version", get(version))
		.route("/traffic", get(traffic))
		.route("/logs", get(logs))
		.route("/metrics", get(metrics))
		.route("/connections", get(connections))
		.route("/proxies", get(get_proxies))
		.route("/proxies/{name}", get(get_proxy))
		.route("/rules", get(get_rules).put(put_rules))
		.route(
			"/inbounds",
			get(get_inbounds).post(add_inbounds).delete(delete_inbounds),
		)
		.route(
			"/outbounds",
			get(get_outbounds)
				.post(add_outbounds)
				.delete(delete_outbounds),
		)
		.route(
			"/outboundgroups",
			get(get_groups).post(add_groups).delete(delete_groups),
		)
		.layer(middleware::from_fn_with_state(state.clone(), authenticate))
		.layer(cors)
		.with_state(state);

	axum::serve(listener, router).await?;
	Ok(())
}

/// Bearer-token auth; browser WebSocket clients cannot set headers, so a
/// `?token=` query parameter is accepted for upgrade requests.
async fn authenticate(
	State(state): State<Arc<AdminState>>,
	Query(params): Query<HashMap<String, String>>,
	headers: HeaderMap,
	request: axum::extract::Request,
	next: middleware::Next,
) -> Response {
	let Some(secret) = state.secret.as_deref() else {
		return next.run(request).await;
	};

	let is_websocket = headers
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	if is_websocket && let Some(token) = params.get("token") {
		if token == secret {
			return next.run(request).await;
		}
		return unauthorized();
	}

	let bearer = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	if bearer == Some(secret) {
		return next.run(request).await;
	}
	unauthorized()
}

fn unauthorized() -> Response {
	(
		StatusCode::UNAUTHORIZED,
		Json(ApiError {
			error: "unauthorized".to_string(),
		}),
	)
		.into_response()
}

async fn hello() -> Json<serde_json::Value> {
	Json(serde_json::json!({"hello": "flowgate"}))
}

async fn version() -> Json<serde_json::Value> {
	Json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Serialize)]
struct Traffic {
	up: u64,
	down: u64,
}

/// Per-second byte deltas, over WebSocket or chunked JSON lines.
async fn traffic(
	State(state): State<Arc<AdminState>>,
	ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
	match ws {
		Ok(ws) => ws.on_upgrade(move |socket| traffic_ws(socket, state)),
		Err(_) => {
			let stream = traffic_stream(state);
			axum::body::Body::from_stream(stream).into_response()
		},
	}
}

fn traffic_stream(
	state: Arc<AdminState>,
) -> impl futures::Stream<Item = Result<String, std::convert::Infallible>> {
	futures::stream::unfold(
		(state, None::<(u64, u64)>),
		|(state, previous)| async move {
			tokio::time::sleep(Duration::from_secs(1)).await;
			let (up, down) = state.tunnel.manager.now();
			let (last_up, last_down) = previous.unwrap_or((up, down));
			let line = serde_json::to_string(&Traffic {
				up: up.saturating_sub(last_up),
				down: down.saturating_sub(last_down),
			})
			.unwrap_or_default()
				+ "\n";
			Some((Ok(line), (state, Some((up, down)))))
		},
	)
}

async fn traffic_ws(mut socket: WebSocket, state: Arc<AdminState>) {
	let mut ticker = tokio::time::interval(Duration::from_secs(1));
	let (mut last_up, mut last_down) = state.tunnel.manager.now();
	loop {
		ticker.tick().await;
		let (up, down) = state.tunnel.manager.now();
		let payload = serde_json::to_string(&Traffic {
			up: up.saturating_sub(last_up),
			down: down.saturating_sub(last_down),
		})
		.unwrap_or_default();
		(last_up, last_down) = (up, down);
		if socket.send(Message::Text(payload.into())).await.is_err() {
			return;
		}
	}
}

#[derive(serde::Deserialize)]
struct LogsQuery {
	#[serde(default)]
	level: Option<String>,
}

async fn logs(
	State(state): State<Arc<AdminState>>,
	Query(query): Query<LogsQuery>,
	ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
	let level = query.level.unwrap_or_else(|| "info".to_string());
	let Some(min_rank) = level_rank(&level) else {
		return bad_request(format!("unknown level {level}"));
	};
	let receiver = state.logs.subscribe();
	match ws {
		Ok(ws) => ws.on_upgrade(move |socket| logs_ws(socket, receiver, min_rank)),
		Err(_) => {
			let stream = futures::stream::unfold(receiver, move |mut receiver| async move {
				loop {
					match receiver.recv().await {
						Ok(event) if event.rank() >= min_rank => {
							let line = serde_json::to_string(&event).unwrap_or_default() + "\n";
							return Some((Ok::<_, std::convert::Infallible>(line), receiver));
						},
						Ok(_) => continue,
						Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
						Err(_) => return None,
					}
				}
			});
			axum::body::Body::from_stream(stream).into_response()
		},
	}
}

async fn logs_ws(
	mut socket: WebSocket,
	mut receiver: tokio::sync::broadcast::Receiver<crate::telemetry::log::LogEvent>,
	min_rank: u8,
) {
	loop {
		match receiver.recv().await {
			Ok(event) if event.rank() >= min_rank => {
				let payload = serde_json::to_string(&event).unwrap_or_default();
				if socket.send(Message::Text(payload.into())).await.is_err() {
					return;
				}
			},
			Ok(_) => {},
			Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
			Err(_) => return,
		}
	}
}

async fn metrics(State(state): State<Arc<AdminState>>) -> Response {
	let mut out = String::new();
	match prometheus_client::encoding::text::encode(&mut out, &state.registry) {
		Ok(()) => (
			[(
				header::CONTENT_TYPE,
				"application/openmetrics-text; version=1.0.0; charset=utf-8",
			)],
			out,
		)
			.into_response(),
		Err(e) => bad_request(e.to_string()),
	}
}

async fn connections(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	Json(serde_json::json!({
		"connections": state.tunnel.manager.snapshot(),
	}))
}

async fn get_proxies(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	Json(serde_json::json!({"proxies": state.tunnel.proxies_json()}))
}

async fn get_proxy(
	State(state): State<Arc<AdminState>>,
	Path(name): Path<String>,
) -> Response {
	match state.tunnel.proxy_json(&name) {
		Some(proxy) => Json(proxy).into_response(),
		None => (
			StatusCode::NOT_FOUND,
			Json(ApiError {
				error: format!("proxy {name} not found"),
			}),
		)
			.into_response(),
	}
}

async fn get_rules(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	Json(serde_json::json!({"rules": state.tunnel.rules_json()}))
}

async fn put_rules(
	State(state): State<Arc<AdminState>>,
	Json(lines): Json<Vec<String>>,
) -> Response {
	let proxies = state.tunnel.proxies();
	match parse_rules(&lines, &proxies, &state.geoip) {
		Ok(rules) => {
			state.tunnel.update_rules(rules);
			StatusCode::NO_CONTENT.into_response()
		},
		Err(e) => bad_request(e.to_string()),
	}
}

async fn get_inbounds(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	Json(serde_json::json!({"inbounds": state.inbounds.snapshot()}))
}

async fn add_inbounds(
	State(state): State<Arc<AdminState>>,
	Json(options): Json<Vec<InboundOption>>,
) -> Response {
	match state.inbounds.add_inbounds(options).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(e) => bad_request(e.to_string()),
	}
}

async fn delete_inbounds(
	State(state): State<Arc<AdminState>>,
	Json(names): Json<Vec<String>>,
) -> Response {
	let names: Vec<Strng> = names.iter().map(strng::new).collect();
	state.inbounds.delete_inbounds(&names);
	StatusCode::NO_CONTENT.into_response()
}

async fn get_outbounds(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	Json(serde_json::json!({"proxies": state.tunnel.proxies_json()}))
}

async fn add_outbounds(
	State(state): State<Arc<AdminState>>,
	Json(options): Json<Vec<OutboundOption>>,
) -> Response {
	let mut parsed = Vec::with_capacity(options.len());
	for option in options {
		match parse_outbound(option) {
			Ok(proxy) => parsed.push(proxy),
			Err(e) => return bad_request(e.to_string()),
		}
	}
	match state.tunnel.add_outbounds(parsed) {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(e) => bad_request(e.to_string()),
	}
}

async fn delete_outbounds(
	State(state): State<Arc<AdminState>>,
	Json(names): Json<Vec<String>>,
) -> Response {
	let names: Vec<Strng> = names.iter().map(strng::new).collect();
	state.tunnel.delete_outbounds(&names);
	StatusCode::NO_CONTENT.into_response()
}

async fn get_groups(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
	let proxies = state.tunnel.proxies();
	let mut groups = serde_json::Map::new();
	let mut names: Vec<_> = proxies.keys().cloned().collect();
	names.sort();
	for name in names {
		let proxy = &proxies[&name];
		if proxy.proto().is_group() {
			groups.insert(name.to_string(), proxy.describe());
		}
	}
	Json(serde_json::json!({"groups": groups}))
}

async fn add_groups(
	State(state): State<Arc<AdminState>>,
	Json(options): Json<Vec<GroupCommonOption>>,
) -> Response {
	match state.tunnel.add_outbound_groups(&options) {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(e) => bad_request(e.to_string()),
	}
}

async fn delete_groups(
	State(state): State<Arc<AdminState>>,
	Json(names): Json<Vec<String>>,
) -> Response {
	let names: Vec<Strng> = names.iter().map(strng::new).collect();
	state.tunnel.delete_outbounds(&names);
	StatusCode::NO_CONTENT.into_response()
}
