//! Upload coordinator HTTP service
//!
//! Signs direct-to-storage uploads, records finished uploads on their POI
//! and hands them to the transcode queue.

pub mod error;
pub mod repositories;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
