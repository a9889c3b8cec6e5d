//! WolfTunnel - Address-multiplexed IP tunnel relay
//!
//! Carries raw IP packets between a virtual network interface and many
//! remote clients. Packets are routed to clients by the destination address
//! in their IP header; each client connection is bound to the addresses it
//! announced in its handshake (raw frames) or used as a source (WebSocket).
//!
//! # Architecture
//!
//! - `packet`: address extraction from raw IP headers
//! - `codec`: obfuscate / cipher / compress transform stack
//! - `wire`: handshake and frame header layouts
//! - `cache`: address -> connection map with sliding TTL
//! - `stats`: per-client counters and throughput chart
//! - `transport`: raw-frame and WebSocket sessions
//! - `device`: tunnel interface contract and implementations
//! - `relay`: the accept loop and the two directional pumps

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod packet;
pub mod relay;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::WolfTunnelConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{Lookup, PeerCache};
    pub use crate::codec::{CodecPipeline, CodecSettings, Profile};
    pub use crate::config::{Protocol, WolfTunnelConfig};
    pub use crate::device::{ChannelTun, ChannelTunPeer, TunnelInterface};
    pub use crate::error::{Error, Result};
    pub use crate::relay::Relay;
    pub use crate::stats::Statistics;
    pub use crate::transport::PeerConn;
    pub use crate::wire::{AuthKey, ClientFrameHeader, ClientHandshake, ServerFrameHeader};
}
