use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use flowgate_core::prelude::*;
use http::header::{CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::errors::ProxyError;
use crate::inbound::auth::{Authenticator, CredentialCache};
use crate::inbound::{Inbound, InboundType, User, metadata_for_target, set_keepalive};
use crate::transport::socks5::SocksAddr;
use crate::tunnel::{ConnContext, Tunnel};
use crate::types::{InboundKind, Metadata, Network};

const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(30);

type Body = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpInboundOption {
	pub name: String,
	pub listen: String,
	pub port: u16,
	#[serde(default)]
	pub users: Vec<User>,
}

/// Local HTTP proxy: CONNECT tunnels, Upgrade pass-through, and plain
/// requests forwarded through the engine via an internal pipe-backed
/// client. Credentials are checked per request with a short-lived cache.
pub struct HttpInbound {
	name: Strng,
	raw_addr: Strng,
	local_addr: SocketAddr,
	handles: Vec<JoinHandle<()>>,
}

struct ProxyState {
	tunnel: Arc<Tunnel>,
	inbound: Strng,
	auth: Option<(Authenticator, CredentialCache)>,
}

impl HttpInbound {
	pub async fn new(
		option: HttpInboundOption,
		tunnel: Arc<Tunnel>,
	) -> Result<Arc<HttpInbound>, ProxyError> {
		let raw_addr = crate::outbound::join_host_port(&option.listen, option.port);
		let listener = TcpListener::bind(raw_addr.as_str())
			.await
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let local = listener
			.local_addr()
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;

		let auth = if option.users.is_empty() {
			None
		} else {
			let pairs: Vec<(String, String)> = option
				.users
				.iter()
				.map(|u| (u.username.clone(), u.password.clone()))
				.collect();
			Some((
				Authenticator::new(&pairs),
				CredentialCache::new(CREDENTIAL_CACHE_TTL),
			))
		};

		let name = strng::new(&option.name);
		info!(inbound = %name, addr = %local, "HTTP inbound listening");

		let state = Arc::new(ProxyState {
			tunnel,
			inbound: name.clone(),
			auth,
		});

		let accept = tokio::spawn(async move {
			loop {
				let (stream, peer) = match listener.accept().await {
					Ok(accepted) => accepted,
					Err(e) => {
						debug!(err = %e, "http accept failed");
						continue;
					},
				};
				set_keepalive(&stream);
				let state = state.clone();
				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let service = service_fn(move |req| {
						let state = state.clone();
						async move { Ok::<_, std::convert::Infallible>(handle(req, state, peer).await) }
					});
					let served = hyper::server::conn::http1::Builder::new()
						.serve_connection(io, service)
						.with_upgrades()
						.await;
					if let Err(e) = served {
						debug!(err = %e, "http connection ended");
					}
				});
			}
		});

		Ok(Arc::new(HttpInbound {
			name,
			raw_addr,
			local_addr: local,
			handles: vec![accept],
		}))
	}
}

impl Inbound for HttpInbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn kind(&self) -> InboundType {
		InboundType::Http
	}

	fn raw_address(&self) -> Strng {
		self.raw_addr.clone()
	}

	fn local_address(&self) -> SocketAddr {
		self.local_addr
	}

	fn close(&self) {
		for handle in &self.handles {
			handle.abort();
		}
		info!(inbound = %self.name, "HTTP inbound closed");
	}
}

async fn handle(req: Request<Incoming>, state: Arc<ProxyState>, peer: SocketAddr) -> Response<Body> {
	if let Some(denied) = authenticate(&req, &state, peer) {
		return denied;
	}
	if req.method() == Method::CONNECT {
		return handle_connect(req, state, peer);
	}
	match proxy_request(req, state, peer).await {
		Ok(response) => response,
		Err(e) => {
			debug!(err = %e, "proxy request failed");
			status_response(StatusCode::BAD_GATEWAY)
		},
	}
}

/// Missing credentials get a 407 challenge; wrong ones get a 403.
fn authenticate(
	req: &Request<Incoming>,
	state: &ProxyState,
	peer: SocketAddr,
) -> Option<Response<Body>> {
	let (authenticator, cache) = state.auth.as_ref()?;

	let credential = req
		.headers()
		.get(PROXY_AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Basic "))
		.map(str::to_string);
	let Some(credential) = credential else {
		let mut response = status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
		response
			.headers_mut()
			.insert(PROXY_AUTHENTICATE, "Basic".parse().expect("static header"));
		return Some(response);
	};

	let authed = cache.get(&credential).unwrap_or_else(|| {
		let verdict = BASE64
			.decode(&credential)
			.ok()
			.and_then(|raw| String::from_utf8(raw).ok())
			.and_then(|plain| {
				let (user, pass) = plain.split_once(':')?;
				Some(authenticator.verify(user, pass))
			})
			.unwrap_or(false);
		cache.set(&credential, verdict);
		verdict
	});

	if authed {
		None
	} else {
		info!(%peer, "proxy auth failed");
		Some(status_response(StatusCode::FORBIDDEN))
	}
}

fn handle_connect(
	req: Request<Incoming>,
	state: Arc<ProxyState>,
	peer: SocketAddr,
) -> Response<Body> {
	let Some(authority) = req.uri().authority().cloned() else {
		return status_response(StatusCode::BAD_REQUEST);
	};
	let Some(port) = authority.port_u16() else {
		return status_response(StatusCode::BAD_REQUEST);
	};
	let target = match authority.host().parse::<IpAddr>() {
		Ok(ip) => SocksAddr::Ip(SocketAddr::new(ip, port)),
		Err(_) => SocksAddr::Domain(strng::new(authority.host()), port),
	};

	// Hand the raw stream to the tunnel once hyper completes the upgrade.
	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let metadata = metadata_for_target(
					&target,
					InboundKind::Https,
					Network::Tcp,
					state.inbound.clone(),
					peer,
				);
				state
					.tunnel
					.submit_tcp(ConnContext {
						stream: Box::new(TokioIo::new(upgraded)),
						metadata,
					})
					.await;
			},
			Err(e) => debug!(err = %e, "connect upgrade failed"),
		}
	});

	status_response(StatusCode::OK)
}

/// Forwards a non-CONNECT request through the engine: the upstream side of
/// an in-memory pipe is submitted as a fresh flow, and a one-shot hyper
/// client speaks HTTP/1.1 across it.
async fn proxy_request(
	mut req: Request<Incoming>,
	state: Arc<ProxyState>,
	peer: SocketAddr,
) -> anyhow::Result<Response<Body>> {
	let (host, port) = target_of(&req).ok_or_else(|| anyhow::anyhow!("request has no host"))?;
	let is_upgrade = is_upgrade_request(&req);

	let target = match host.parse::<IpAddr>() {
		Ok(ip) => SocksAddr::Ip(SocketAddr::new(ip, port)),
		Err(_) => SocksAddr::Domain(strng::new(&host), port),
	};
	let metadata: Metadata = metadata_for_target(
		&target,
		InboundKind::Http,
		Network::Tcp,
		state.inbound.clone(),
		peer,
	);

	let (near, far) = tokio::io::duplex(32 * 1024);
	state
		.tunnel
		.submit_tcp(ConnContext {
			stream: Box::new(far),
			metadata,
		})
		.await;

	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(near)).await?;
	tokio::spawn(async move {
		if let Err(e) = conn.with_upgrades().await {
			debug!(err = %e, "internal client connection ended");
		}
	});

	// The upstream sees an origin-form request addressed with its own Host.
	let origin_form = req
		.uri()
		.path_and_query()
		.cloned()
		.unwrap_or_else(|| PathAndQuery::from_static("/"));
	let mut parts = http::uri::Parts::default();
	parts.path_and_query = Some(origin_form);
	*req.uri_mut() = Uri::from_parts(parts)?;
	let host_value = strip_default_port(&host, port);
	req
		.headers_mut()
		.insert(HOST, host_value.parse()?);

	if is_upgrade {
		// Keep the Upgrade/Connection headers; only our proxy headers go.
		remove_proxy_headers(req.headers_mut());
		let client_upgrade = hyper::upgrade::on(&mut req);
		let mut response = sender.send_request(req).await?;
		if response.status() == StatusCode::SWITCHING_PROTOCOLS {
			let server_upgrade = hyper::upgrade::on(&mut response);
			tokio::spawn(async move {
				let upgraded = tokio::try_join!(client_upgrade, server_upgrade);
				match upgraded {
					Ok((client, server)) => {
						let _ = flowgate_core::copy::copy_bidirectional(
							TokioIo::new(client),
							TokioIo::new(server),
						)
						.await;
					},
					Err(e) => debug!(err = %e, "upgrade relay failed"),
				}
			});
		}
		return Ok(response.map(|b| b.boxed()));
	}

	remove_hop_by_hop_headers(req.headers_mut());
	let mut response = sender.send_request(req).await?;
	remove_hop_by_hop_headers(response.headers_mut());
	Ok(response.map(|b| b.boxed()))
}

fn target_of(req: &Request<Incoming>) -> Option<(String, u16)> {
	if let Some(authority) = req.uri().authority() {
		return Some((
			authority.host().to_string(),
			authority.port_u16().unwrap_or(80),
		));
	}
	let host = req.headers().get(HOST)?.to_str().ok()?;
	match host.rsplit_once(':') {
		Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
			Some((name.to_string(), port.parse().ok()?))
		},
		_ => Some((host.to_string(), 80)),
	}
}

/// `example.com:80` behaves badly with some origin servers; send the bare
/// name for the default port.
fn strip_default_port(host: &str, port: u16) -> String {
	if port == 80 {
		host.to_string()
	} else {
		format!("{host}:{port}")
	}
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
	req
		.headers()
		.get_all(CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn remove_proxy_headers(headers: &mut HeaderMap) {
	headers.remove("proxy-connection");
	headers.remove(PROXY_AUTHENTICATE);
	headers.remove(PROXY_AUTHORIZATION);
}

/// RFC 7230 §6.1: drop the fixed hop-by-hop set plus anything named by the
/// Connection header itself.
fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
	remove_proxy_headers(headers);

	let named: Vec<HeaderName> = headers
		.get_all(CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|token| token.trim().parse::<HeaderName>().ok())
		.collect();
	headers.remove(CONNECTION);
	for name in named {
		headers.remove(name);
	}

	headers.remove("te");
	headers.remove("trailers");
	headers.remove("transfer-encoding");
	headers.remove("upgrade");
	headers.remove("keep-alive");
}

fn status_response(status: StatusCode) -> Response<Body> {
	let mut response = Response::new(
		Empty::<Bytes>::new()
			.map_err(|never| match never {})
			.boxed(),
	);
	*response.status_mut() = status;
	response
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_by_hop_headers_are_stripped() {
		let mut headers = HeaderMap::new();
		headers.insert(CONNECTION, "keep-alive, X-Custom-Hop".parse().unwrap());
		headers.insert("x-custom-hop", "gone".parse().unwrap());
		headers.insert("transfer-encoding", "chunked".parse().unwrap());
		headers.insert(PROXY_AUTHORIZATION, "Basic dTpw".parse().unwrap());
		headers.insert("accept", "*/*".parse().unwrap());

		remove_hop_by_hop_headers(&mut headers);

		assert!(headers.get(CONNECTION).is_none());
		assert!(headers.get("x-custom-hop").is_none());
		assert!(headers.get("transfer-encoding").is_none());
		assert!(headers.get(PROXY_AUTHORIZATION).is_none());
		assert_eq!(headers.get("accept").unwrap(), "*/*");
	}

	#[test]
	fn default_port_is_stripped_from_host() {
		assert_eq!(strip_default_port("example.com", 80), "example.com");
		assert_eq!(strip_default_port("example.com", 8080), "example.com:8080");
	}

	#[test]
	fn upgrade_detection_is_token_based() {
		let req = Request::builder()
			.header(CONNECTION, "keep-alive, Upgrade")
			.body(())
			.unwrap();
		assert!(is_upgrade_request(&req));
		let req = Request::builder()
			.header(CONNECTION, "keep-alive")
			.body(())
			.unwrap();
		assert!(!is_upgrade_request(&req));
	}
}
