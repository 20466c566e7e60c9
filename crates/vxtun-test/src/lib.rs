//! Test infrastructure for vxtun
//!
//! Provides:
//! - A recording, scriptable command runner
//! - A fake host identity (platform / privilege)
//! - Host and supervisor fixtures for common scenarios
//! - Command verification helpers

pub mod fixtures;
mod mock;
mod verification;

pub use fixtures::*;
pub use mock::{FakeHost, MockRunner};
pub use verification::*;
