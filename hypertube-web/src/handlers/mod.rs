//! HTTP request handlers

pub mod api;
pub mod utils;

pub use api::{FileQuery, FileStatus, download_file, write_loaded_parts};
pub use utils::{ApiError, ApiResponse};
