//! KNX addressing.
//!
//! Only individual addresses (Area.Line.Device) appear at the tunnel level:
//! the server reports the address it assigned to the tunnel in the CRD.

pub mod individual;

pub use individual::IndividualAddress;
