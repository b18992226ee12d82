pub mod copy;
pub mod metrics;
pub mod prelude;
pub mod signal;
pub mod strng;
