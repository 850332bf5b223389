//! Channel delivery: retry policy, circuit breaking, provider adapters,
//! fan-out dispatch and provider callback correlation.

pub mod breaker;
pub mod correlator;
pub mod directory;
pub mod dispatcher;
pub mod pipeline;
pub mod provider;
pub mod providers;
pub mod retry;
