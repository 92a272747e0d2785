//! Subscriber side of the gateway.
//!
//! - [`session`] - per-connection subscriber handle with a bounded queue
//! - [`bucket`] - topic to subscriber fanout table
//! - [`sharding`] - subscribe-time topic rewrite for hot topics
//! - [`ids`] - snowflake id generator
//! - [`context`] - dependencies shared across the process
//! - [`manager`] - composes the above with the upstream transport

pub mod bucket;
pub mod context;
pub mod ids;
pub mod manager;
pub mod session;
pub mod sharding;

pub use bucket::{Bucket, PushReport, SweepReport};
pub use context::GatewayContext;
pub use ids::IdGenerator;
pub use manager::GatewayManager;
pub use session::{Delivery, Session};
pub use sharding::{fnv1a32, HotTopicSharding, SubscribeHook};
