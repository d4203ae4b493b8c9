//! Hypertube Web - download-trigger JSON API
//!
//! Thin axum surface over `hypertube-core`: starts background downloads of
//! stored file records and replays saved parts to disk.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]

pub mod handlers;
pub mod server;

pub use server::{AppState, build_router, run_server};
