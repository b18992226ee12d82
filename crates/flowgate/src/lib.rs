pub mod app;
pub mod config;
pub mod errors;
pub mod group;
pub mod inbound;
pub mod management;
pub mod outbound;
pub mod provider;
pub mod resolve;
pub mod rules;
pub mod telemetry;
pub mod transport;
pub mod tunnel;
pub mod types;

pub use errors::ProxyError;

use flowgate_core::prelude::*;

/// Reserved outbound names. DIRECT and REJECT always exist and cannot be
/// deleted; GLOBAL is derived from the full outbound set after every
/// mutation.
pub const DIRECT: Strng = strng::literal!("DIRECT");
pub const REJECT: Strng = strng::literal!("REJECT");
pub const GLOBAL: Strng = strng::literal!("GLOBAL");

/// Default deadline for outbound TCP dials.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for outbound UDP binds.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for TLS handshakes on outbound streams.
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle timeout after which a UDP NAT session is evicted.
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
