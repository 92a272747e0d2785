//! Firetower Gateway Core Library
//!
//! This library provides the core of a publish/subscribe gateway. Clients
//! connect, subscribe to topics and receive messages published by other
//! clients or by an upstream topic service. The gateway keeps one
//! self-healing framed TCP connection to that service and fans every message
//! it receives out to local subscribers without ever waiting on a slow one.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`network`] - Frame codec, messages, and the client-facing listener
//! - [`gateway`] - Sessions, the fanout bucket, sharding, and the manager
//! - [`transport`] - Reconnecting connection to the topic service
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use firetower_core::{GatewayConfig, GatewayContext, GatewayManager, GatewayListener};
//!
//! let config = GatewayConfig::from_file("config.yaml")?;
//! let manager = Arc::new(GatewayManager::new(GatewayContext::new(config)));
//! manager.start().await?;
//! GatewayListener::new(Arc::clone(&manager)).run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod network;
pub mod transport;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use error::{ConfigError, GatewayError, ProtocolError, Result};
pub use gateway::{Bucket, GatewayContext, GatewayManager, HotTopicSharding, Session, SubscribeHook};
pub use metrics::GatewayMetrics;
pub use network::{FireCodec, GatewayListener, Message};
pub use transport::{LinkState, TopicServiceClient, TransportConfig, UpstreamPublisher};
