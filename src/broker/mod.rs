//! Broker Signaling Transport
//!
//! MQTT 3.1.1 over binary web-sockets against a redundant set of public
//! brokers. The pool treats every broker as equivalent: publishes fan out
//! to all of them, and the dedup cache collapses the duplicate inbound
//! copies.

pub mod client;
pub mod dedup;
pub mod error;
pub mod packet;
pub mod pool;

pub use client::{BrokerClient, BrokerEvent};
pub use dedup::DedupCache;
pub use error::{BrokerError, FrameError};
pub use packet::{Connect, FrameReassembler, Packet, Publish};
pub use pool::{BrokerPool, PoolEvent};
