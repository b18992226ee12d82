use std::ops::Deref;

/// Strng is a cheaply clone-able, immutable string.
/// Most strings in the proxy are names and addresses that are cloned onto
/// every flow, so reference counting beats re-allocating.
pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	s.as_ref().into()
}

pub const EMPTY: Strng = literal!("");

/// RichStrng wraps Strng to provide the trait implementations (prometheus
/// label encoding, in particular) we cannot put on the alias directly.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct RichStrng(Strng);

impl Deref for RichStrng {
	type Target = Strng;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T: Into<Strng>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl prometheus_client::encoding::EncodeLabelValue for RichStrng {
	fn encode(
		&self,
		encoder: &mut prometheus_client::encoding::LabelValueEncoder,
	) -> Result<(), std::fmt::Error> {
		prometheus_client::encoding::EncodeLabelValue::encode(&self.0.as_str(), encoder)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clone_is_shallow() {
		let a = new("example.com");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_ptr(), b.as_ptr());
	}
}
