//! KNX addressing.
//!
//! Two address kinds exist on a KNX network:
//! - Individual addresses identify physical devices (Area.Line.Device)
//! - Group addresses identify logical datapoints (Main/Middle/Sub or
//!   Main/Sub); group address 0 is the broadcast destination

pub mod group;
pub mod individual;

#[doc(inline)]
pub use group::GroupAddress;
#[doc(inline)]
pub use individual::IndividualAddress;
