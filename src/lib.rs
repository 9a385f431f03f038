#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![doc = include_str!("../README.md")]

//! ## Crate layout
//!
//! - [`protocol::frame`] and [`protocol::services`]: KNXnet/IP frame codecs
//! - [`protocol::engine`]: the sans-IO connection state machine
//! - [`protocol::tunnel`] and [`protocol::device_management`]: connection kinds
//! - [`protocol::async_connection`]: tokio driver (feature `tokio`)
//! - [`net`]: endpoint helpers and the transport seam

// Macro modules (must be declared before use)
#[macro_use]
pub mod logging;

pub mod addressing;
pub mod configuration;
pub mod error;
pub mod net;
pub mod protocol;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::IndividualAddress;
#[doc(inline)]
pub use configuration::{ConnectionConfig, ConnectionKind};
#[doc(inline)]
pub use error::{ErrorCode, KnxError, Result};
#[doc(inline)]
pub use net::Endpoint;
#[doc(inline)]
pub use protocol::engine::{ConnectionEngine, Event, Output, SocketKind, State, TimerKind};
#[doc(inline)]
pub use protocol::tunnel::TunnelLayer;

#[cfg(feature = "tokio")]
#[doc(inline)]
pub use protocol::async_connection::ConnectionHandle;
