use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use prometheus_client::registry::Registry;

use crate::strng::RichStrng;

pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("flowgate")
}

/// A label value that encodes as "unknown" when absent, so a missing
/// dimension never produces an empty label.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(Option<T>);

impl DefaultedUnknown<RichStrng> {
	pub fn display(&self) -> Option<String> {
		self.0.as_ref().map(|s| s.to_string())
	}
}

impl<T> DefaultedUnknown<T> {
	pub fn inner(self) -> Option<T> {
		self.0
	}
}

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(t: Option<T>) -> Self {
		DefaultedUnknown(t)
	}
}

impl From<String> for DefaultedUnknown<RichStrng> {
	fn from(t: String) -> Self {
		if t.is_empty() {
			DefaultedUnknown(None)
		} else {
			DefaultedUnknown(Some(t.into()))
		}
	}
}

impl From<crate::strng::Strng> for DefaultedUnknown<RichStrng> {
	fn from(t: crate::strng::Strng) -> Self {
		if t.is_empty() {
			DefaultedUnknown(None)
		} else {
			DefaultedUnknown(Some(t.into()))
		}
	}
}

impl From<Option<&crate::strng::Strng>> for DefaultedUnknown<RichStrng> {
	fn from(t: Option<&crate::strng::Strng>) -> Self {
		DefaultedUnknown(t.map(|s| s.clone().into()))
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		match self {
			DefaultedUnknown(Some(i)) => i.encode(writer),
			DefaultedUnknown(None) => writer.write_str("unknown"),
		}
	}
}

/// Encodes any Display type as a label value.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct EncodeDisplay<T>(pub T);

impl<T: std::fmt::Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		write!(writer, "{}", &self.0)
	}
}
