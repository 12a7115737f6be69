//! Providers hand out raw connections to service ports on a device

use std::{fmt, future::Future, pin::Pin, time::Duration};

#[cfg(feature = "tcp")]
use tokio::net::TcpStream;

use crate::{ConnectionError, ServiceConnection};

/// Where a service lives: a host and the port advertised for it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// # Arguments
    /// * `host` - hostname or IP literal, IPv6 without brackets
    /// * `port` - the port advertised for the service
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 literals need brackets to stay unambiguous
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Settings shared by every connection a provider opens
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Label sent to services during check-in
    pub label: String,
    /// Bound on each authoritative request round trip
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            label: "springboard-remote".to_string(),
            request_timeout: ServiceConnection::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ProviderConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A provider for connecting to service ports on the device
pub trait ServiceProvider: Unpin + Send + Sync + fmt::Debug {
    /// Opens a raw connection to `port`, before any check-in
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceConnection, ConnectionError>> + Send + '_>>;

    /// The device host and the port advertised for the service
    fn address(&self) -> &Address;
}

#[cfg(feature = "tcp")]
#[derive(Debug, Clone)]
pub struct TcpProvider {
    pub addr: Address,
    pub config: ProviderConfig,
}

#[cfg(feature = "tcp")]
impl TcpProvider {
    pub fn new(addr: impl Into<Address>) -> Self {
        Self {
            addr: addr.into(),
            config: ProviderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(feature = "tcp")]
impl ServiceProvider for TcpProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceConnection, ConnectionError>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect((self.addr.host.as_str(), port)).await?;
            Ok(
                ServiceConnection::new(Box::new(stream), self.config.label.clone())
                    .with_request_timeout(self.config.request_timeout),
            )
        })
    }

    fn address(&self) -> &Address {
        &self.addr
    }
}
