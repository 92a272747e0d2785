//! Network layer for the gateway.
//!
//! This module provides:
//! - the `FireHeader` frame codec spoken with the topic service
//! - the decoded [`Message`] type
//! - the JSON line protocol spoken with clients
//! - the TCP listener and per-connection handler for clients

pub mod codec;
pub mod connection;
pub mod listener;
pub mod message;
pub mod request;

pub use codec::FireCodec;
pub use connection::ConnectionHandler;
pub use listener::GatewayListener;
pub use message::Message;
pub use request::{ClientEvent, ClientRequest, RequestKind};
