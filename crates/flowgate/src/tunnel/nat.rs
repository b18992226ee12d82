use std::collections::HashMap;

use flowgate_core::prelude::*;

use crate::transport::BoxedDatagram;

/// One bound outbound datagram endpoint serving everything a client source
/// sends, until the session idles out.
pub struct UdpSession {
	pub datagram: BoxedDatagram,
	last_activity: Mutex<tokio::time::Instant>,
}

impl UdpSession {
	pub fn new(datagram: BoxedDatagram) -> Arc<UdpSession> {
		Arc::new(UdpSession {
			datagram,
			last_activity: Mutex::new(tokio::time::Instant::now()),
		})
	}

	pub fn touch(&self) {
		*self.last_activity.lock().expect("activity lock") = tokio::time::Instant::now();
	}

	pub fn idle(&self) -> Duration {
		self.last_activity.lock().expect("activity lock").elapsed()
	}
}

/// Session table keyed by client source address, with a per-key lock that
/// serializes first-miss resolution: the first packet of a burst resolves
/// and installs the session while the rest wait on the same lock and then
/// find the entry.
pub struct NatTable {
	sessions: Mutex<HashMap<Strng, Arc<UdpSession>>>,
	locks: Mutex<HashMap<Strng, Arc<AsyncMutex<()>>>>,
}

impl NatTable {
	pub fn new() -> NatTable {
		NatTable {
			sessions: Mutex::new(HashMap::new()),
			locks: Mutex::new(HashMap::new()),
		}
	}

	pub fn get(&self, key: &Strng) -> Option<Arc<UdpSession>> {
		self.sessions.lock().expect("sessions lock").get(key).cloned()
	}

	pub fn insert(&self, key: Strng, session: Arc<UdpSession>) {
		self
			.sessions
			.lock()
			.expect("sessions lock")
			.insert(key, session);
	}

	pub fn remove(&self, key: &Strng) -> Option<Arc<UdpSession>> {
		self.sessions.lock().expect("sessions lock").remove(key)
	}

	/// Returns the resolution lock for a key, and whether it already
	/// existed (meaning another task got there first).
	pub fn get_or_create_lock(&self, key: &Strng) -> (Arc<AsyncMutex<()>>, bool) {
		let mut locks = self.locks.lock().expect("locks lock");
		match locks.get(key) {
			Some(lock) => (lock.clone(), true),
			None => {
				let lock = Arc::new(AsyncMutex::new(()));
				locks.insert(key.clone(), lock.clone());
				(lock, false)
			},
		}
	}

	pub fn remove_lock(&self, key: &Strng) {
		self.locks.lock().expect("locks lock").remove(key);
	}

	pub fn session_count(&self) -> usize {
		self.sessions.lock().expect("sessions lock").len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::OutboundDatagram;
	use async_trait::async_trait;

	struct NullDatagram;

	#[async_trait]
	impl OutboundDatagram for NullDatagram {
		async fn send_to(&self, buf: &[u8], _dst: SocketAddr) -> std::io::Result<usize> {
			Ok(buf.len())
		}

		async fn recv_from(&self, _buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
			std::future::pending().await
		}

		fn local_addr(&self) -> std::io::Result<SocketAddr> {
			Ok(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
		}

		fn close(&self) {}
	}

	#[tokio::test]
	async fn lock_is_shared_then_removed() {
		let nat = NatTable::new();
		let key = strng::new("10.0.0.5:30000");
		let (first, existed) = nat.get_or_create_lock(&key);
		assert!(!existed);
		let (second, existed) = nat.get_or_create_lock(&key);
		assert!(existed);
		assert!(Arc::ptr_eq(&first, &second));

		nat.remove_lock(&key);
		let (_, existed) = nat.get_or_create_lock(&key);
		assert!(!existed);
	}

	#[tokio::test]
	async fn sessions_round_trip() {
		let nat = NatTable::new();
		let key = strng::new("10.0.0.5:30000");
		assert!(nat.get(&key).is_none());
		nat.insert(key.clone(), UdpSession::new(Arc::new(NullDatagram)));
		assert!(nat.get(&key).is_some());
		assert_eq!(nat.session_count(), 1);
		nat.remove(&key);
		assert!(nat.get(&key).is_none());
	}
}
