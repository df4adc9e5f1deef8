//! Wire protocol and TCP transport

pub mod framing;
pub mod hub;
pub mod protocol;
pub mod transport;
