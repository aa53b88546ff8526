//! Chat synchronization core.
//!
//! Maintains a live, ordered view of conversations and messages over an
//! unreliable hub connection, reconciles it against the REST source of truth
//! on every reconnect, and exposes immutable snapshots to any number of UI
//! observers.
//!
//! All state lives behind a single-writer coordinator task; the stores in
//! this crate are plain owned data structures with no interior locking.

pub mod client;
pub mod config;
mod coordinator;
pub mod error;
pub mod index;
pub mod receipts;
pub mod store;
pub mod typing;

pub use client::{ChatClient, ChatSnapshot, UserProfile};
pub use config::SyncConfig;
pub use error::SyncError;
pub use store::{GroupPosition, MessageStore, group_positions};
pub use typing::TypingUser;
