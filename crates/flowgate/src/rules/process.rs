use flowgate_core::prelude::*;

use crate::rules::{Rule, RuleType};
use crate::types::Metadata;

fn base_name(path: &str) -> &str {
	path.rsplit(['/', '\\']).next().unwrap_or(path)
}

pub struct Process {
	process: Strng,
	adapter: Strng,
	name_only: bool,
}

impl Process {
	pub fn new(process: &str, adapter: Strng, name_only: bool) -> Process {
		Process {
			process: strng::new(process),
			adapter,
			name_only,
		}
	}
}

impl Rule for Process {
	fn rule_type(&self) -> RuleType {
		if self.name_only {
			RuleType::ProcessName
		} else {
			RuleType::ProcessPath
		}
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		let Some(path) = metadata.process_path.as_ref() else {
			return false;
		};
		if self.name_only {
			base_name(path).eq_ignore_ascii_case(&self.process)
		} else {
			path.eq_ignore_ascii_case(&self.process)
		}
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.process.clone()
	}

	fn should_find_process(&self) -> bool {
		true
	}
}

/// Matches every flow whose process is NOT in the `|`-separated list.
/// Useful as a broad exclusion before a terminal rule.
pub struct NotProcess {
	processes: Vec<Strng>,
	payload: Strng,
	adapter: Strng,
	name_only: bool,
}

impl NotProcess {
	pub fn new(processes: &str, adapter: Strng, name_only: bool) -> NotProcess {
		NotProcess {
			processes: processes.split('|').map(strng::new).collect(),
			payload: strng::new(processes),
			adapter,
			name_only,
		}
	}
}

impl Rule for NotProcess {
	fn rule_type(&self) -> RuleType {
		if self.name_only {
			RuleType::ProcessName
		} else {
			RuleType::ProcessPath
		}
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		let path = metadata.process_path.as_deref().unwrap_or_default();
		!self.processes.iter().any(|p| {
			if self.name_only {
				base_name(path).eq_ignore_ascii_case(p)
			} else {
				path.eq_ignore_ascii_case(p)
			}
		})
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.payload.clone()
	}

	fn should_find_process(&self) -> bool {
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};

	fn meta(path: Option<&str>) -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.process_path = path.map(strng::new);
		m
	}

	#[test]
	fn name_only_matches_basename() {
		let rule = Process::new("curl", strng::new("T"), true);
		assert!(rule.matches(&meta(Some("/usr/bin/curl"))));
		assert!(!rule.matches(&meta(Some("/usr/bin/wget"))));
		assert!(!rule.matches(&meta(None)));
	}

	#[test]
	fn full_path_is_exact() {
		let rule = Process::new("/usr/bin/curl", strng::new("T"), false);
		assert!(rule.matches(&meta(Some("/usr/bin/curl"))));
		assert!(!rule.matches(&meta(Some("/opt/bin/curl"))));
	}

	#[test]
	fn not_process_excludes_listed() {
		let rule = NotProcess::new("curl|wget", strng::new("T"), true);
		assert!(!rule.matches(&meta(Some("/usr/bin/curl"))));
		assert!(!rule.matches(&meta(Some("/bin/wget"))));
		assert!(rule.matches(&meta(Some("/usr/bin/ssh"))));
	}
}
