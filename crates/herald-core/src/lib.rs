//! Core domain model, signing, and task storage.
//!
//! Provides the persisted delivery task and its lifecycle states, the HMAC
//! payload signer shared by the dispatcher and receivers, the clock
//! abstraction used for deterministic tests, and the PostgreSQL task store
//! with its concurrency-safe claim protocol. Every other crate builds on
//! these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempts;
pub mod error;
pub mod models;
pub mod signing;
pub mod storage;
pub mod time;

pub use attempts::{
    AttemptDisposition, AttemptHandler, AttemptOutcome, AttemptRecord, MulticastAttemptHandler,
    NoOpAttemptHandler,
};
pub use error::{CoreError, Result};
pub use models::{DeliveryTask, TaskFilter, TaskId, TaskStatus};
pub use signing::{
    PayloadSigner, SignatureError, SignedPayload, DEVELOPMENT_SECRET, SIGNATURE_HEADER,
};
pub use time::{Clock, RealClock, TestClock};
