use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use flowgate_core::prelude::*;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::errors::ProxyError;
use crate::outbound::{Outbound, ProxyType, join_host_port};
use crate::transport::BoxedStream;
use crate::types::Metadata;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshOutboundOption {
	pub name: String,
	pub server: String,
	pub port: u16,
	pub username: String,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub key_path: Option<String>,
	#[serde(default)]
	pub passphrase: Option<String>,
}

enum SshAuth {
	Password(String),
	Key {
		path: String,
		passphrase: Option<String>,
	},
}

/// Tunnels TCP flows through SSH direct-tcpip channels. Dials share one
/// lazily-built client per adapter; a dead client is detected on the next
/// dial and rebuilt. Host keys are accepted without verification, which is
/// a documented operator risk.
pub struct SshOutbound {
	name: Strng,
	addr: Strng,
	username: String,
	auth: SshAuth,
	config: Arc<client::Config>,
	client: AsyncMutex<Option<Handle<AcceptingHandler>>>,
}

impl SshOutbound {
	pub fn new(option: SshOutboundOption) -> Result<Arc<SshOutbound>, ProxyError> {
		let auth = match (&option.password, &option.key_path) {
			(_, Some(path)) => SshAuth::Key {
				path: path.clone(),
				passphrase: option.passphrase.clone(),
			},
			(Some(pass), None) => SshAuth::Password(pass.clone()),
			(None, None) => {
				return Err(ProxyError::InvalidConfig(format!(
					"ssh outbound {} needs a password or key-path",
					option.name
				)));
			},
		};
		let config = Arc::new(client::Config {
			inactivity_timeout: None,
			keepalive_interval: Some(Duration::from_secs(30)),
			..Default::default()
		});
		Ok(Arc::new(SshOutbound {
			name: strng::new(option.name),
			addr: join_host_port(&option.server, option.port),
			username: option.username,
			auth,
			config,
			client: AsyncMutex::new(None),
		}))
	}

	async fn client_over<S>(&self, stream: S) -> Result<Handle<AcceptingHandler>, ProxyError>
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let mut handle = client::connect_stream(self.config.clone(), stream, AcceptingHandler)
			.await
			.map_err(|e| ProxyError::HandshakeFailed(format!("{} ssh: {e}", self.addr)))?;
		self.authenticate(&mut handle).await?;
		Ok(handle)
	}

	async fn authenticate(&self, handle: &mut Handle<AcceptingHandler>) -> Result<(), ProxyError> {
		let auth_failed = || ProxyError::HandshakeFailed(format!("{} ssh auth rejected", self.addr));
		let map_err =
			|e: russh::Error| ProxyError::HandshakeFailed(format!("{} ssh auth: {e}", self.addr));
		let result = match &self.auth {
			SshAuth::Password(pass) => handle
				.authenticate_password(&self.username, pass)
				.await
				.map_err(map_err)?,
			SshAuth::Key { path, passphrase } => {
				let key = russh::keys::load_secret_key(path, passphrase.as_deref())
					.map_err(|e| ProxyError::InvalidConfig(format!("read ssh key {path}: {e}")))?;
				let hash = handle
					.best_supported_rsa_hash()
					.await
					.map_err(map_err)?
					.flatten();
				handle
					.authenticate_publickey(
						&self.username,
						PrivateKeyWithHashAlg::new(Arc::new(key), hash),
					)
					.await
					.map_err(map_err)?
			},
		};
		if !matches!(result, client::AuthResult::Success) {
			return Err(auth_failed());
		}
		Ok(())
	}

	async fn open_channel(
		&self,
		handle: &Handle<AcceptingHandler>,
		metadata: &Metadata,
	) -> Result<russh::ChannelStream<client::Msg>, ProxyError> {
		let host = if !metadata.host.is_empty() {
			metadata.host.to_string()
		} else if let Some(ip) = metadata.dst_ip {
			ip.to_string()
		} else {
			return Err(ProxyError::AddressUnsupported);
		};
		let channel = handle
			.channel_open_direct_tcpip(host, metadata.dst_port as u32, "0.0.0.0", 0)
			.await
			.map_err(|e| {
				ProxyError::dial(
					strng::new(metadata.remote_addr()),
					io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()),
				)
			})?;
		Ok(channel.into_stream())
	}
}

#[async_trait]
impl Outbound for SshOutbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Ssh
	}

	fn addr(&self) -> Option<Strng> {
		Some(self.addr.clone())
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		let mut guard = self.client.lock().await;
		if guard.as_ref().map(|h| h.is_closed()).unwrap_or(true) {
			let tcp = TcpStream::connect(self.addr.as_str())
				.await
				.map_err(|e| ProxyError::dial(self.addr.clone(), e))?;
			let _ = tcp.set_nodelay(true);
			*guard = Some(self.client_over(tcp).await?);
			debug!(server = %self.addr, "ssh client established");
		}
		let handle = guard.as_ref().expect("client installed");
		match self.open_channel(handle, metadata).await {
			Ok(stream) => Ok(Box::new(stream)),
			Err(e) => {
				// The session may have died under us; drop it so the next dial
				// starts clean.
				*guard = None;
				Err(e)
			},
		}
	}

	/// Relay hops hand us their established connection; the client built
	/// over it cannot be pooled, so each chained stream pays a fresh SSH
	/// handshake.
	async fn stream_through(
		&self,
		underlying: Option<BoxedStream>,
		metadata: &Metadata,
	) -> Result<BoxedStream, ProxyError> {
		let stream = underlying.ok_or(ProxyError::EmptyConnection)?;
		let handle = self.client_over(stream).await?;
		let channel = self.open_channel(&handle, metadata).await?;
		Ok(Box::new(ChannelWithClient {
			stream: channel,
			_client: handle,
		}))
	}
}

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
	type Error = russh::Error;

	async fn check_server_key(
		&mut self,
		_server_public_key: &russh::keys::PublicKey,
	) -> Result<bool, Self::Error> {
		Ok(true)
	}
}

/// Keeps the one-shot client alive for as long as its channel is in use.
struct ChannelWithClient {
	stream: russh::ChannelStream<client::Msg>,
	_client: Handle<AcceptingHandler>,
}

impl AsyncRead for ChannelWithClient {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_read(cx, buf)
	}
}

impl AsyncWrite for ChannelWithClient {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.stream).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_shutdown(cx)
	}
}
