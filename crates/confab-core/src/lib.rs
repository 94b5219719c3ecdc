//! confab-core — media and signaling core for the Confab conferencing
//! client.
//!
//! # Architecture
//!
//! - **domain**: wire formats, control messages, identifiers, session
//!   states (pure data, no I/O).
//! - **application**: use cases + port traits — transport links with
//!   logon/keepalive/watchdog/backoff, two-phase capture sessions,
//!   render channels, and the conference client that orchestrates them.
//! - **adapters**: WebSocket transport (tungstenite), packet AEAD
//!   (AES-256-GCM), and media plumbing (frame splitter/collector,
//!   lock-free playout ring, voice activity detection).

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;

pub use application::conference::{ConferenceClient, ConferenceDeps, Credentials};
pub use config::ClientConfig;
