//! cloudsync library
//!
//! Folder synchronization over a small tagged binary protocol: clients
//! mirror a local folder into a per-client server directory, see who else
//! is online and ask the server to relay files to other clients.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod status;
pub mod storage;
pub mod url;
pub mod watcher;

pub use client::{ClientSession, SessionState};
pub use error::{Result, SyncError};
pub use protocol_core::Message;
pub use server::ServerRegistry;
