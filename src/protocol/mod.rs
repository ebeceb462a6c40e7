//! KNXnet/IP protocol implementation.
//!
//! Wire-format codecs for the KNXnet/IP header, service bodies, cEMI
//! frames and the KNX IP Secure services.

pub mod cemi;
pub mod constants;
pub mod frame;
pub mod secure;
pub mod services;
