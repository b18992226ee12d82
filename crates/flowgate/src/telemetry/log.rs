use std::fmt::Write as _;

use flowgate_core::prelude::*;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Severity rank used by the log stream's `?level=` filter.
pub fn level_rank(level: &str) -> Option<u8> {
	match level {
		"debug" => Some(0),
		"info" => Some(1),
		"warning" | "warn" => Some(2),
		"error" => Some(3),
		_ => None,
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
	#[serde(rename = "type")]
	pub level: String,
	pub payload: String,
}

impl LogEvent {
	pub fn rank(&self) -> u8 {
		level_rank(&self.level).unwrap_or(1)
	}
}

/// Fan-out of formatted log events to however many stream subscribers are
/// connected. Slow subscribers lag and drop, they never block logging.
#[derive(Clone)]
pub struct LogBroadcast {
	tx: broadcast::Sender<LogEvent>,
}

impl LogBroadcast {
	pub fn new() -> LogBroadcast {
		let (tx, _) = broadcast::channel(1024);
		LogBroadcast { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
		self.tx.subscribe()
	}
}

impl Default for LogBroadcast {
	fn default() -> Self {
		Self::new()
	}
}

struct BroadcastLayer {
	tx: broadcast::Sender<LogEvent>,
}

impl<S: tracing::Subscriber> Layer<S> for BroadcastLayer {
	fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
		let mut visitor = FlatVisitor::default();
		event.record(&mut visitor);
		let level = match *event.metadata().level() {
			tracing::Level::ERROR => "error",
			tracing::Level::WARN => "warning",
			tracing::Level::INFO => "info",
			_ => "debug",
		};
		let _ = self.tx.send(LogEvent {
			level: level.to_string(),
			payload: visitor.out,
		});
	}
}

#[derive(Default)]
struct FlatVisitor {
	out: String,
}

impl Visit for FlatVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
		if field.name() == "message" {
			if self.out.is_empty() {
				let _ = write!(self.out, "{value:?}");
			} else {
				let mut msg = format!("{value:?} ");
				msg.push_str(&self.out);
				self.out = msg;
			}
		} else {
			if !self.out.is_empty() {
				self.out.push(' ');
			}
			let _ = write!(self.out, "{}={:?}", field.name(), value);
		}
	}
}

/// Installs the global subscriber: env-filterable stderr output plus the
/// broadcast tee feeding the management log stream.
pub fn init(level: &str, broadcast: &LogBroadcast) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("flowgate={level},flowgate_core={level}")));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.with(BroadcastLayer {
			tx: broadcast.tx.clone(),
		})
		.try_init()
		.map_err(|e| anyhow::anyhow!("install subscriber: {e}"))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ranks_order_levels() {
		assert!(level_rank("debug") < level_rank("info"));
		assert!(level_rank("info") < level_rank("warning"));
		assert!(level_rank("warning") < level_rank("error"));
		assert_eq!(level_rank("bogus"), None);
	}
}
