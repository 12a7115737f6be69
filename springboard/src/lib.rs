#![doc = include_str!("../README.md")]

pub mod lockdown;
pub mod provider;
pub mod services;
pub mod utils;

pub use services::*;

use plist_macro::plist;
use std::{io, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

pub use plist_macro::{pretty_print_dictionary, pretty_print_plist};

/// Largest frame body accepted from a service, in bytes
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// A trait combining all required characteristics for a service socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed service sockets
pub type ServiceSocket = Box<dyn ReadWrite>;

/// One open channel to a named remote service
///
/// Messages are plist dictionaries framed by a 4-byte big-endian length.
/// The connection is exclusively owned by whoever opened it.
#[derive(Debug)]
pub struct ServiceConnection {
    socket: Option<ServiceSocket>,
    label: String,
    request_timeout: Duration,
}

impl ServiceConnection {
    /// Default bound on a `send_plist_request` round trip
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new service connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Identifier sent to the service during check-in
    pub fn new(socket: ServiceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replaces the bound applied to `send_plist_request`
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// False once the socket has been closed or dropped after a failure
    /// that left the stream out of sync
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Performs the RSD check-in with a shim service
    ///
    /// Only the check-in reply is consumed here. The service follows it with a
    /// `StartService` message, which is left on the wire for the caller.
    ///
    /// # Errors
    /// Returns `ConnectionError::UnexpectedResponse` if the service does not
    /// echo the check-in request
    pub async fn rsd_checkin(&mut self) -> Result<(), ConnectionError> {
        let req = plist!({
            "Label": self.label.clone(),
            "ProtocolVersion": "2",
            "Request": "RSDCheckin",
        });
        let req = req
            .into_dictionary()
            .ok_or(ConnectionError::UnexpectedResponse)?;
        self.send_plist(req).await?;

        let res = self.read_plist().await?;
        match res.get("Request").and_then(|x| x.as_string()) {
            Some("RSDCheckin") => Ok(()),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Sends a message and reads exactly one reply
    pub async fn send_and_receive(
        &mut self,
        message: plist::Dictionary,
    ) -> Result<plist::Dictionary, ConnectionError> {
        self.send_plist(message).await?;
        self.read_plist().await
    }

    /// Sends a request and reads its reply, bounded by the request timeout
    ///
    /// A timeout can strike in the middle of a frame, so the socket is
    /// dropped with it. Later calls fail with `NoEstablishedConnection`
    /// instead of reading leftover bytes as a length header.
    ///
    /// # Errors
    /// Returns `ConnectionError::Timeout` if no complete reply arrives in time
    pub async fn send_plist_request(
        &mut self,
        message: plist::Dictionary,
    ) -> Result<plist::Dictionary, ConnectionError> {
        let timeout = self.request_timeout;
        match tokio::time::timeout(timeout, self.send_and_receive(message)).await {
            Ok(res) => res,
            Err(_) => {
                warn!("No reply within {timeout:?}, dropping the connection");
                self.socket = None;
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }

    /// Sends a plist dictionary as an XML frame
    ///
    /// # Errors
    /// Returns `ConnectionError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: plist::Dictionary) -> Result<(), ConnectionError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {}", pretty_print_dictionary(&message));

            let mut buf = Vec::new();
            plist::to_writer_xml(&mut buf, &message)?;
            let len = frame_len(buf.len())?;
            trace!("Writing frame of {len} bytes");
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(&buf).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(ConnectionError::NoEstablishedConnection)
        }
    }

    /// Reads one framed plist dictionary
    ///
    /// # Errors
    /// Returns `ConnectionError` if reading or parsing fails, or if the
    /// service reports an error in the message
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, ConnectionError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            let len = u32::from_be_bytes(buf);
            trace!("Reading frame of {len} bytes");
            if len > MAX_FRAME_SIZE {
                // The body is never read, so the stream cannot be resynced
                self.socket = None;
                return Err(ConnectionError::FrameTooLarge(len));
            }
            let mut buf = vec![0; len as usize];
            socket.read_exact(&mut buf).await?;
            let res: plist::Dictionary = plist::from_bytes(&buf)?;
            debug!("Received plist: {}", pretty_print_dictionary(&res));

            if let Some(e) = res.get("Error") {
                let e = match e.as_string() {
                    Some(e) => e,
                    None => return Err(ConnectionError::UnexpectedResponse),
                };
                return Err(ConnectionError::from_device_error_type(e, &res)
                    .unwrap_or_else(|| ConnectionError::UnknownErrorType(e.to_string())));
            }
            Ok(res)
        } else {
            Err(ConnectionError::NoEstablishedConnection)
        }
    }

    /// Shuts down the write half and drops the socket
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await?;
        }
        Ok(())
    }
}

/// Checks an outgoing body against the frame limit, saturating to `u32`
fn frame_len(len: usize) -> Result<u32, ConnectionError> {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    if len > MAX_FRAME_SIZE {
        Err(ConnectionError::FrameTooLarge(len))
    } else {
        Ok(len)
    }
}

/// Failures raised by a service connection
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("device socket io failed: {0}")]
    Socket(#[from] io::Error),
    #[error("io on plist: {0}")]
    Plist(#[from] plist::Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u32),
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device locked")]
    DeviceLocked,
    #[error("invalid service")]
    InvalidService,
    #[error("service prohibited")]
    ServiceProhibited,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl ConnectionError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from the service
    /// * `context` - Full message, consulted for `DetailedError`
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InvalidService" => Some(Self::InvalidService),
            "ServiceProhibited" => Some(Self::ServiceProhibited),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ConnectionError::Socket(_) => -1,
            ConnectionError::Plist(_) => -2,
            ConnectionError::UnexpectedResponse => -3,
            ConnectionError::NoEstablishedConnection => -4,
            ConnectionError::Timeout(_) => -5,
            ConnectionError::FrameTooLarge(_) => -6,
            ConnectionError::GetProhibited => -7,
            ConnectionError::InvalidHostID => -8,
            ConnectionError::SessionInactive => -9,
            ConnectionError::DeviceLocked => -10,
            ConnectionError::InvalidService => -11,
            ConnectionError::ServiceProhibited => -12,
            ConnectionError::InternalError(_) => -13,
            ConnectionError::UnknownErrorType(_) => -14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ServiceConnection, ServiceConnection) {
        let (host, device) = tokio::io::duplex(1024 * 64);
        (
            ServiceConnection::new(Box::new(host), "host"),
            ServiceConnection::new(Box::new(device), "device"),
        )
    }

    fn dict(pairs: &[(&str, &str)]) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        for (k, v) in pairs {
            d.insert(k.to_string(), (*v).into());
        }
        d
    }

    #[tokio::test]
    async fn frames_are_length_prefixed_xml() {
        let (host, mut device) = tokio::io::duplex(1024 * 64);
        let mut conn = ServiceConnection::new(Box::new(host), "host");
        conn.send_plist(dict(&[("command", "getInterfaceOrientation")]))
            .await
            .unwrap();

        let mut len = [0u8; 4];
        device.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        device.read_exact(&mut body).await.unwrap();

        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.starts_with("<?xml"));
        let parsed: plist::Dictionary = plist::from_bytes(&body).unwrap();
        assert_eq!(
            parsed.get("command").and_then(|x| x.as_string()),
            Some("getInterfaceOrientation")
        );
    }

    #[tokio::test]
    async fn send_and_receive_is_one_round_trip() {
        let (mut host, mut device) = pair();
        let server = tokio::spawn(async move {
            let req = device.read_plist().await.unwrap();
            assert_eq!(req.get("command").and_then(|x| x.as_string()), Some("ping"));
            device.send_plist(dict(&[("reply", "pong")])).await.unwrap();
        });

        let res = host.send_and_receive(dict(&[("command", "ping")])).await.unwrap();
        assert_eq!(res.get("reply").and_then(|x| x.as_string()), Some("pong"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn device_errors_are_translated() {
        let (mut host, mut device) = pair();
        tokio::spawn(async move {
            device.read_plist().await.unwrap();
            device
                .send_plist(dict(&[("Error", "InvalidService")]))
                .await
                .unwrap();
            device.read_plist().await.unwrap();
            device
                .send_plist(dict(&[
                    ("Error", "InternalError"),
                    ("DetailedError", "shim crashed"),
                ]))
                .await
                .unwrap();
            device.read_plist().await.unwrap();
            device.send_plist(dict(&[("Error", "Bogus")])).await.unwrap();
        });

        let e = host.send_and_receive(dict(&[])).await.unwrap_err();
        assert!(matches!(e, ConnectionError::InvalidService));

        let e = host.send_and_receive(dict(&[])).await.unwrap_err();
        assert_eq!(e.to_string(), "internal error: shim crashed");

        let e = host.send_and_receive(dict(&[])).await.unwrap_err();
        assert!(matches!(e, ConnectionError::UnknownErrorType(ref s) if s == "Bogus"));
        assert_eq!(e.code(), -14);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut conn = ServiceConnection::new(Box::new(host), "host");
        device
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let e = conn.read_plist().await.unwrap_err();
        assert!(matches!(e, ConnectionError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
        let e = conn.read_plist().await.unwrap_err();
        assert!(matches!(e, ConnectionError::NoEstablishedConnection));
    }

    #[test]
    fn outgoing_frame_limit_reports_length() {
        assert_eq!(frame_len(12).unwrap(), 12);
        assert_eq!(frame_len(MAX_FRAME_SIZE as usize).unwrap(), MAX_FRAME_SIZE);

        let e = frame_len(MAX_FRAME_SIZE as usize + 1).unwrap_err();
        assert!(matches!(e, ConnectionError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
        let e = frame_len(usize::MAX).unwrap_err();
        assert!(matches!(e, ConnectionError::FrameTooLarge(u32::MAX)));
    }

    #[tokio::test]
    async fn plist_request_times_out() {
        let (host, _device) = pair();
        let mut host = host.with_request_timeout(Duration::from_millis(50));

        let e = host
            .send_plist_request(dict(&[("command", "slow")]))
            .await
            .unwrap_err();
        assert!(matches!(e, ConnectionError::Timeout(_)));
    }

    #[tokio::test]
    async fn timeout_mid_frame_closes_connection() {
        let (host, mut device) = tokio::io::duplex(1024 * 64);
        let mut host = ServiceConnection::new(Box::new(host), "host")
            .with_request_timeout(Duration::from_millis(100));

        let reply = plist!({ "Status": "Complete" });
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &reply).unwrap();
        let (head, tail) = body.split_at(body.len() / 2);
        let (head, tail) = (head.to_vec(), tail.to_vec());
        let len = body.len() as u32;

        tokio::spawn(async move {
            let mut header = [0u8; 4];
            device.read_exact(&mut header).await.unwrap();
            let mut req = vec![0u8; u32::from_be_bytes(header) as usize];
            device.read_exact(&mut req).await.unwrap();

            device.write_all(&len.to_be_bytes()).await.unwrap();
            device.write_all(&head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = device.write_all(&tail).await;
        });

        let e = host
            .send_plist_request(dict(&[("command", "slow")]))
            .await
            .unwrap_err();
        assert!(matches!(e, ConnectionError::Timeout(_)));

        // The rest of the half-read frame must not be parsed as a new reply
        let e = host
            .send_plist_request(dict(&[("command", "next")]))
            .await
            .unwrap_err();
        assert!(matches!(e, ConnectionError::NoEstablishedConnection));
    }

    #[tokio::test]
    async fn checkin_requires_echo() {
        let (mut host, mut device) = pair();
        tokio::spawn(async move {
            let req = device.read_plist().await.unwrap();
            assert_eq!(req.get("Label").and_then(|x| x.as_string()), Some("host"));
            assert_eq!(req.get("ProtocolVersion").and_then(|x| x.as_string()), Some("2"));
            device
                .send_plist(dict(&[("Request", "StartService")]))
                .await
                .unwrap();
        });

        let e = host.rsd_checkin().await.unwrap_err();
        assert!(matches!(e, ConnectionError::UnexpectedResponse));
    }

    #[tokio::test]
    async fn closed_connection_refuses_io() {
        let (mut host, _device) = pair();
        host.close().await.unwrap();
        let e = host.send_plist(dict(&[])).await.unwrap_err();
        assert!(matches!(e, ConnectionError::NoEstablishedConnection));
    }
}
