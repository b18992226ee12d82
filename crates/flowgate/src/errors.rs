use flowgate_core::prelude::*;

/// Error vocabulary for the whole engine. Listener parse failures stay at
/// the listener (the connection is just closed); everything that crosses a
/// module boundary is one of these.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("duplicate name: {0}")]
	DuplicateName(Strng),

	#[error("unknown proxy type: {0}")]
	UnknownProxyType(Strng),

	#[error("dial {0} failed: {1}")]
	DialFailed(Strng, #[source] std::io::Error),

	#[error("handshake failed: {0}")]
	HandshakeFailed(String),

	#[error("proxy authentication required")]
	AuthRequired,

	#[error("proxy authentication failed")]
	AuthFailed,

	#[error("no available proxies")]
	NoAvailableProxy,

	#[error("proxy group cycle involving {0}")]
	RelayLoop(Strng),

	#[error("{0} does not support UDP")]
	UdpUnsupported(Strng),

	#[error("unsupported address")]
	AddressUnsupported,

	#[error("operation timed out")]
	Timeout,

	#[error("ssh stream requires an underlying connection")]
	EmptyConnection,
}

impl ProxyError {
	pub fn dial(target: impl Into<Strng>, err: std::io::Error) -> Self {
		ProxyError::DialFailed(target.into(), err)
	}
}

impl From<tokio::time::error::Elapsed> for ProxyError {
	fn from(_: tokio::time::error::Elapsed) -> Self {
		ProxyError::Timeout
	}
}
