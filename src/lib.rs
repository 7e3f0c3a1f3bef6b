//! # Warren
//!
//! TLS-tunneled layer-3 VPN that multiplexes many authenticated clients onto
//! a single multi-queue TUN interface.
//!
//! Each client gets a private IPv4 address from a configured netblock and
//! exchanges whole IPv4 packets with the server as length-prefixed frames on
//! one long-lived TLS connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Host network stack                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                TUN device (multi-queue, IPv4)                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  tun readers ──► router ──► per-client tx sinks ──► TLS tx   │
//! │  TLS rx ──► ingress filter ──► shared tun-write queue        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  lifecycle publisher ──► router / tracker / netblock         │
//! ├──────────────────────────────────────────────────────────────┤
//! │            TLS listener, one session task per client         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Frame lengths are bounded by MTU
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ignored_unit_patterns)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod tun;

pub use config::Config;
pub use error::{Error, Result};

/// Library version, also sent in the application handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum IPv4 payload carried in one wire frame.
///
/// Fixed for wire compatibility; the TUN interface MTU is set to match.
pub const MTU: usize = 1300;
