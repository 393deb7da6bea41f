//! Client-side state for a realtime chat application.
//!
//! The stores here hold the session, the peer directory and the open
//! conversation, reconcile REST-fetched history with realtime pushes, and
//! count unseen messages per peer. Rendering is left to whoever subscribes
//! to the [`bus::EventBus`].

pub mod api;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod entity;
pub mod error;
pub mod realtime;
pub mod session;
pub mod store;

pub use client::{ChatClient, Collaborators};
pub use config::Config;
pub use error::{ChatError, Result};
