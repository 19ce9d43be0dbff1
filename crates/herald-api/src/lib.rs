//! herald HTTP API.
//!
//! Accepts webhook delivery requests, exposes task state for inspection, and
//! reports service health. Delivery itself happens in `herald-delivery`; this
//! crate only writes new tasks and reads existing ones.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use herald_core::{storage::Storage, Clock};

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Task store.
    pub storage: Arc<Storage>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates handler state over `storage`.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}
