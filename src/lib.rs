#![doc = include_str!("../README.md")]

//! # knx-netip
//!
//! Client-side KNXnet/IP protocol stack.
//!
//! The crate is layered the way the protocol is:
//!
//! - [`protocol`] — bit-exact codecs for the KNXnet/IP header, service
//!   bodies, cEMI frames and the secure services
//! - [`discovery`] — multicast/unicast search and description requests
//! - [`connection`] — tunneling and local device management with the
//!   shared send/acknowledgment state machine and heartbeat
//! - [`routing`] — unconfirmed multicast with flow control
//! - [`secure`] — KNX IP Secure sessions and secure multicast
//! - [`transport_layer`] — OSI-4 destinations with sequenced
//!   acknowledgments
//! - [`mgmt`] — application-layer property, memory and management
//!   services
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_netip::connection::{BlockingMode, TunnelConfig, TunnelConnection};
//!
//! let server = "192.168.1.10:3671".parse().unwrap();
//! let tunnel = TunnelConnection::open(TunnelConfig::new(server))?;
//! # let frame: knx_netip::protocol::cemi::CemiLData = unimplemented!();
//! tunnel.send(&frame, BlockingMode::WaitForCon)?;
//! tunnel.close();
//! # Ok::<(), knx_netip::KnxError>(())
//! ```

pub mod addressing;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod mgmt;
pub mod net;
pub mod protocol;
pub mod routing;
pub mod secure;
pub mod security;
pub mod transport_layer;

// Re-export commonly used types
pub use addressing::{GroupAddress, IndividualAddress};
pub use error::{KnxError, Result};
