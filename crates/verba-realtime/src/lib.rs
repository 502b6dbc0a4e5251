//! Typed client for the hosted realtime voice API.
//!
//! The wire protocol is a fixed external contract: a WebSocket carrying
//! JSON events discriminated by `type`. Both directions are modeled as
//! closed enums so an unhandled event kind is a visible gap at the match
//! site, not a silently ignored dictionary key.

pub mod audio;
mod client;
pub mod types;

pub use client::{Client, ClientTx, ServerRx, connect, connect_with_config};
pub use client::config::{Config, ConfigBuilder};
