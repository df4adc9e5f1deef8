//! Game-side collaborators: the environment and policy seams, NPC workers,
//! session kinds and trajectory recording.

pub mod engine;
pub mod input_buffer;
pub mod kinds;
pub mod latest;
pub mod npc;
pub mod policy;
pub mod sandbox;
pub mod trajectory;
