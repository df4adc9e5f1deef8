//! Lobby system: session IDs, matchmaking, the per-session state machine and
//! the tick scheduler.

pub mod allocator;
pub mod broadcast;
pub mod manager;
pub mod matchmaker;
pub mod player;
pub mod room;
pub mod scheduler;
