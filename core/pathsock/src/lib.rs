//! pathsock: path management for a peer-to-peer overlay
//!
//! This crate keeps a working path to every peer of a node:
//! - disco probing (Ping / Pong / CallMeMaybe) over direct UDP and relays
//! - per-peer path selection with latency-based upgrades and heartbeats
//! - a pool of relay connections with route hints and idle cleanup
//! - self-endpoint discovery (STUN, port mapping, local interfaces)
//! - UDP sockets that survive rebinds
//!
//! ```text
//!                  data plane (encrypted tunnel packets)
//!                     │ send            ▲ receive_ipv4/ipv6/relay
//!                     ▼                 │
//!   ┌─────────────────────── Conn ───────────────────────┐
//!   │  PeerHandle ─► Endpoint ─► best UDP addr | relay   │
//!   │        disco Ping/Pong/CallMeMaybe interception    │
//!   └──────┬──────────────────────────────┬──────────────┘
//!          │ pconn4 / pconn6              │ RelayClient per region
//!          ▼                              ▼
//!       peers (UDP)                  relay servers
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod candidate;
pub mod config;
pub mod conn;
pub mod disco;
pub mod endpoint;
pub mod error;
pub mod key;
pub mod metrics;
pub mod netcheck;
pub mod netmap;
mod peer_map;
pub mod rebind;
pub mod relay;
pub mod status;
pub mod timer;

pub use config::{Config, Options};
pub use conn::{Conn, PeerHandle};
pub use error::{Error, RecvError, SendError};
pub use metrics::Metrics;
pub use status::Status;
