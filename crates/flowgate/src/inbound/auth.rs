use std::collections::HashMap;

use flowgate_core::prelude::*;

/// Username/password table shared by the HTTP and SOCKS listeners.
pub struct Authenticator {
	users: HashMap<String, String>,
}

impl Authenticator {
	pub fn new(users: &[(String, String)]) -> Authenticator {
		Authenticator {
			users: users.iter().cloned().collect(),
		}
	}

	pub fn verify(&self, user: &str, pass: &str) -> bool {
		self.users.get(user).is_some_and(|p| p == pass)
	}

	/// SOCKS4 carries only a userid; accept any configured username.
	pub fn verify_user(&self, user: &str) -> bool {
		self.users.contains_key(user)
	}
}

/// Remembers recent Proxy-Authorization verdicts so a keep-alive client is
/// not re-verified on every request.
pub struct CredentialCache {
	ttl: Duration,
	entries: Mutex<HashMap<String, (bool, tokio::time::Instant)>>,
}

impl CredentialCache {
	pub fn new(ttl: Duration) -> CredentialCache {
		CredentialCache {
			ttl,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub fn get(&self, credential: &str) -> Option<bool> {
		let mut entries = self.entries.lock().expect("cache lock");
		match entries.get(credential) {
			Some((verdict, stored)) if stored.elapsed() < self.ttl => Some(*verdict),
			Some(_) => {
				entries.remove(credential);
				None
			},
			None => None,
		}
	}

	pub fn set(&self, credential: &str, verdict: bool) {
		let mut entries = self.entries.lock().expect("cache lock");
		// Opportunistically shed expired entries so the map stays bounded by
		// the set of recently-seen credentials.
		if entries.len() > 64 {
			let ttl = self.ttl;
			entries.retain(|_, (_, stored)| stored.elapsed() < ttl);
		}
		entries.insert(credential.to_string(), (verdict, tokio::time::Instant::now()));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verify_checks_pairs() {
		let auth = Authenticator::new(&[("u".into(), "p".into())]);
		assert!(auth.verify("u", "p"));
		assert!(!auth.verify("u", "x"));
		assert!(!auth.verify("v", "p"));
		assert!(auth.verify_user("u"));
	}

	#[tokio::test(start_paused = true)]
	async fn cache_expires() {
		let cache = CredentialCache::new(Duration::from_secs(30));
		cache.set("dTpw", true);
		assert_eq!(cache.get("dTpw"), Some(true));
		tokio::time::advance(Duration::from_secs(31)).await;
		assert_eq!(cache.get("dTpw"), None);
	}
}
