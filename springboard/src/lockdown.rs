//! Lockdown-style service start
//!
//! Remote shim services are reached directly on their advertised port and
//! accept an RSD check-in before any command.

use std::borrow::Cow;

use tracing::debug;

use crate::{ConnectionError, ServiceConnection, provider::ServiceProvider};

/// What to start: a registered service name and the port it listens on
///
/// Only `port` selects the shim. Remote shims are not looked up by name, so
/// `service_name` is carried for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub service_name: Cow<'static, str>,
    pub port: u16,
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<Cow<'static, str>>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            port,
        }
    }
}

/// Opens a connection to a service and checks in with it
///
/// The connection goes to `config.port` on the provider's host; the service
/// name is only logged.
///
/// # Errors
/// Returns `ConnectionError` if the port cannot be reached or the check-in
/// is not acknowledged
pub async fn start_lockdown_service(
    provider: &dyn ServiceProvider,
    config: &ServiceConfig,
) -> Result<ServiceConnection, ConnectionError> {
    debug!(
        "Starting {} at {}:{}",
        config.service_name,
        provider.address().host,
        config.port
    );
    let mut conn = provider.connect(config.port).await?;
    conn.rsd_checkin().await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use std::{future::Future, pin::Pin};

    use super::*;
    use crate::provider::Address;

    #[derive(Debug)]
    struct DuplexProvider {
        addr: Address,
        reply: &'static str,
    }

    impl ServiceProvider for DuplexProvider {
        fn connect(
            &self,
            port: u16,
        ) -> Pin<Box<dyn Future<Output = Result<ServiceConnection, ConnectionError>> + Send + '_>>
        {
            assert_eq!(port, self.addr.port);
            let reply = self.reply;
            Box::pin(async move {
                let (host, device) = tokio::io::duplex(1024 * 64);
                tokio::spawn(async move {
                    let mut device = ServiceConnection::new(Box::new(device), "device");
                    let req = device.read_plist().await.unwrap();
                    assert_eq!(
                        req.get("Request").and_then(|x| x.as_string()),
                        Some("RSDCheckin")
                    );
                    let mut res = plist::Dictionary::new();
                    res.insert("Request".into(), reply.into());
                    device.send_plist(res).await.unwrap();
                });
                Ok(ServiceConnection::new(Box::new(host), "tests"))
            })
        }

        fn address(&self) -> &Address {
            &self.addr
        }
    }

    #[tokio::test]
    async fn checks_in_on_configured_port() {
        let provider = DuplexProvider {
            addr: Address::new("127.0.0.1", 49152),
            reply: "RSDCheckin",
        };
        let config = ServiceConfig::new("com.example.shim", 49152);
        start_lockdown_service(&provider, &config).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unacknowledged_checkin() {
        let provider = DuplexProvider {
            addr: Address::new("127.0.0.1", 49152),
            reply: "Nope",
        };
        let config = ServiceConfig::new("com.example.shim", 49152);
        let e = start_lockdown_service(&provider, &config).await.unwrap_err();
        assert!(matches!(e, ConnectionError::UnexpectedResponse));
    }
}
