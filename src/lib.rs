//! Session Relay Library
//!
//! A real-time session server: bounded session slots, matchmaking, fixed-rate
//! tick loops and NPC decision workers, served over length-prefixed JSON on
//! TCP.

pub mod config;
pub mod game;
pub mod lobby;
pub mod metrics;
pub mod net;
