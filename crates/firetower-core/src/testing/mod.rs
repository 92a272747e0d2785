//! Test utilities for the gateway.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockTopicService`] - A lightweight mock topic service speaking the frame protocol
//! - [`GatewayTestHarness`] - A started gateway connected to a mock service
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//! - [`TestClient`] - A JSON line client for the front-facing protocol
//!
//! # Example
//!
//! ```rust,ignore
//! use firetower_core::testing::{GatewayTestHarness, TEST_TIMEOUT};
//!
//! #[tokio::test]
//! async fn test_roundtrip() {
//!     let harness = GatewayTestHarness::new().await;
//!     let mut client = harness.connect_client().await;
//!
//!     client.subscribe("room").await;
//!     harness.service.broadcast("publish", "room", b"hi");
//!
//!     let event = client.recv(TEST_TIMEOUT).await.unwrap();
//!     assert_eq!(event.topic, "room");
//! }
//! ```

pub mod harness;
pub mod mock_topic_service;

pub use harness::{eventually, GatewayTestHarness, TestClient, TestHarnessBuilder, TEST_TIMEOUT};
pub use mock_topic_service::MockTopicService;
