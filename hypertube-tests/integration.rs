//! Integration tests for Hypertube
//!
//! Full downloads against loopback fakes: an axum HTTP tracker, a tokio UDP
//! tracker speaking BEP 15 and tokio TCP seeders speaking the peer wire
//! protocol.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/download_flow.rs"]
mod download_flow;
#[path = "integration/multi_file.rs"]
mod multi_file;
#[path = "integration/udp_download.rs"]
mod udp_download;
