//! # Broadcasting Module
//!
//! This module fans the "current motion" out to every connected web viewer.
//! There is exactly one topic; viewers that join late only see messages
//! published after they connect.
//!
//! ## Architecture Overview
//!
//! 1. **Hub**: [`hub::BroadcastHub`] owns the viewer registry on the
//!    single-threaded event context. Publishers hold a [`hub::HubHandle`] and
//!    marshal messages onto the hub through an unbounded FIFO channel, so a
//!    publish from the control-plane thread never touches viewer state
//!    directly.
//!
//! 2. **Web Server (Axum)**: [`server`] accepts WebSocket upgrades, registers
//!    each socket with the hub, and forwards serialized messages to it.
//!
//! 3. **Messages**: [`messages::ViewerMessage`] defines the two wire kinds,
//!    `status` and `motion`.

pub mod hub;
pub mod messages;
pub mod server;

pub use hub::{BroadcastHub, HubHandle, Viewer};
pub use messages::{StatusState, ViewerMessage};
