//! Upstream transport to the topic service.
//!
//! - [`backoff`] - capped exponential backoff and a cancellable retry loop
//! - [`management`] - management channel bootstrap
//! - [`connection`] - the reconnecting framed TCP client

pub mod backoff;
pub mod connection;
pub mod management;

pub use backoff::{retry, Backoff, BackoffPolicy};
pub use connection::{LinkState, TopicServiceClient, TransportConfig, UpstreamPublisher};
pub use management::{ManagementChannel, ManagementDialer, TcpManagementDialer};
