//! Shared test doubles for the integration tests in this directory: an in-memory `Storage` and
//! a `SessionDelegate` that plays transport/PubSub/trust-policy roles against a small in-process
//! network shared by every simulated account in a test.

pub mod delegate;
pub mod memory_storage;
