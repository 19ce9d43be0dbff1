//! Test infrastructure for the herald workspace.
//!
//! Provides isolated PostgreSQL schemas, wiremock-backed receivers, task
//! fixtures, and the receiver simulator used both by integration tests and
//! by the `mock-receiver` binary.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;
pub mod http;
pub mod receiver;

pub use database::TestDatabase;
pub use fixtures::TaskBuilder;
pub use herald_core::{Clock, TestClock};
pub use self::http::{MockEndpoint, MockResponse, MockServer, RecordedRequest};
pub use receiver::{ReceiverConfig, ReceiverSimulator};
