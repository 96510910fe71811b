//! Reference backend: the Medra HTTP API over in-memory state.
//!
//! Serves the same auth, patient, chat, upload and stream endpoints the client talks to.
//! Used by the integration tests and by `medra serve` for local development.

mod server;
mod state;

pub use server::{router, run_backend};
pub use state::BackendState;
