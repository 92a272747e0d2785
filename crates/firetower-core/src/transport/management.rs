//! Management channel to the topic service.
//!
//! The gateway only needs to know that the management endpoint is reachable
//! before it opens the framed topic stream, so the channel is modelled as a
//! dial capability returning a handle with a single verification call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{GatewayError, Result};

/// An established management channel.
#[async_trait]
pub trait ManagementChannel: Send + Sync {
    /// Address the channel was dialled on.
    fn address(&self) -> &str;

    /// Issue the unary verification call.
    async fn verify(&self) -> Result<()>;
}

/// Opens management channels.
#[async_trait]
pub trait ManagementDialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<Arc<dyn ManagementChannel>>;
}

/// Dials by opening a TCP connection to the management address.
#[derive(Debug, Clone)]
pub struct TcpManagementDialer {
    connect_timeout: Duration,
}

impl TcpManagementDialer {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ManagementDialer for TcpManagementDialer {
    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> Result<Arc<dyn ManagementChannel>> {
        let channel = TcpManagementChannel {
            address: address.to_string(),
            connect_timeout: self.connect_timeout,
        };
        channel.verify().await?;
        debug!("management channel established");
        Ok(Arc::new(channel))
    }
}

struct TcpManagementChannel {
    address: String,
    connect_timeout: Duration,
}

#[async_trait]
impl ManagementChannel for TcpManagementChannel {
    fn address(&self) -> &str {
        &self.address
    }

    async fn verify(&self) -> Result<()> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Connect {
                address: self.address.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(GatewayError::Connect {
                address: self.address.clone(),
                message: "connection timeout".to_string(),
            }),
        }
    }
}
