//! A relay that lets any devtools protocol client drive the tabs of a real,
//! logged in browser through a small in-browser extension.
//!
//! The [`Hub`](handler::Hub) accepts exactly one extension connection and any
//! number of control clients, keeps track of the sessions the extension holds
//! and routes commands and events between both sides. The [`extension`]
//! module is the counterpart living in the browser.

pub mod config;
pub mod conn;
pub mod error;
pub mod extension;
pub mod handler;
pub mod relay;
pub mod server;

pub use crate::config::{PeerConfig, RelayConfig};
pub use crate::error::{RelayError, Result};
pub use crate::relay::Relay;
pub use crate::server::RelayServer;
pub use nutbot_relay_types as types;
