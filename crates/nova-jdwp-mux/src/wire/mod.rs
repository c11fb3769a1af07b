//! Byte-level JDWP helpers shared by the sessions.

pub mod codec;
pub(crate) mod poison;

// The scripted VM peer is only needed for tests and downstream integration suites.
// Compile it for this crate's own unit tests unconditionally (via `cfg(test)`), while keeping
// it behind the `test-support` feature for normal builds and for downstream crates.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
