//! Peer-to-peer chat core: pooled peer sessions, operation routing with
//! admission control, and history sync between peers.

pub mod app;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod router;
pub mod storage;
pub mod sync;

pub use app::AppContext;
pub use error::{Error, Result};
