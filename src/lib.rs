//! # Skylink
//!
//! Vehicle communication link layer for ground control software.
//!
//! Skylink owns the byte pipes between a ground station and its vehicles:
//! serial telemetry radios, UDP and TCP sockets, recorded telemetry logs and
//! simulated vehicles. Every link runs its transport on a dedicated thread,
//! draws protocol channels from a shared pool, tracks per-vehicle liveness
//! and hands validated MAVLink frames to downstream consumers.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Frame sinks (decoder, logger, vehicles)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Link Manager                           │
//! │   registry · frame routing · teardown of unreferenced links     │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │  Link 1  │  │  Link 2  │  │  Link 3  │  │  Link N  │         │
//! │  │ (serial) │  │  (UDP)   │  │  (TCP)   │  │  (mock)  │         │
//! │  │ thread   │  │ thread   │  │ thread   │  │ thread   │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │         Channel Allocator (shared protocol channel pool)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │      Transports (serial · UDP · TCP · log replay · mock)        │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Byte counts fit the stats counters
#![allow(clippy::cast_precision_loss)]       // Acceptable for display
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::future_not_send)]           // Link thread futures run on a local runtime
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod channel;
pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port ground stations listen on
pub const DEFAULT_UDP_PORT: u16 = 14550;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::ChannelAllocator;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::link::{ConnectOutcome, Link, LinkConfiguration, LinkEvent};
    pub use crate::manager::{FrameSink, LinkManager, ManagerConfig, ManagerEvent, RoutedFrame};
    pub use crate::protocol::{FrameScanner, MavFrame};
    pub use crate::transport::{Transport, TransportKind};
    pub use crate::types::*;
}
