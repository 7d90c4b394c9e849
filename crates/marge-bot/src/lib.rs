//! The marge merge-bot engine
//!
//! A human assigns a ready MR to the bot; a worker serialises its landing
//! against the target branch tip, verifies CI on the exact post-merge
//! content, and finalises the merge through the forge, so that every
//! commit reaching a protected branch has passed CI on identical source.
//!
//! The binary in `main.rs` wires configuration, the forge client and
//! signal handling around [`coordinator::Coordinator`].

pub mod batch;
pub mod cli;
pub mod coordinator;
pub mod embargo;
pub mod logger;
pub mod view;
pub mod worker;
