//! SpringBoard Services Client
//!
//! Talks to the SpringBoard remote shim, which manages the home screen: icon
//! layout, icon images, wallpapers and interface orientation.
//!
//! Every command is a plist dictionary with a `command` key. The shim answers
//! each command in two steps: the first reply on a fresh exchange is the
//! pending `StartService` acknowledgement and carries nothing useful, the
//! second reply is the actual result. The client therefore sends every
//! command twice and keeps only the second reply.

use std::{borrow::Cow, fmt};

use plist_macro::plist;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    ConnectionError, ServiceConnection,
    lockdown::{ServiceConfig, start_lockdown_service},
    provider::{Address, ServiceProvider},
    utils::plist::truncate_dates_to_seconds,
};

#[cfg(feature = "tcp")]
use crate::provider::TcpProvider;

/// Screen orientation reported by SpringBoard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum InterfaceOrientation {
    /// 0 degrees
    Portrait = 1,
    /// 180 degrees
    PortraitUpsideDown = 2,
    /// 90 degrees clockwise
    Landscape = 3,
    /// 270 degrees clockwise
    LandscapeHomeToLeft = 4,
}

impl InterfaceOrientation {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for InterfaceOrientation {
    type Error = UnknownOrientation;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Portrait),
            2 => Ok(Self::PortraitUpsideDown),
            3 => Ok(Self::Landscape),
            4 => Ok(Self::LandscapeHomeToLeft),
            v => Err(UnknownOrientation(v)),
        }
    }
}

impl fmt::Display for InterfaceOrientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Portrait => "portrait",
            Self::PortraitUpsideDown => "portrait-upside-down",
            Self::Landscape => "landscape",
            Self::LandscapeHomeToLeft => "landscape-home-left",
        };
        f.write_str(name)
    }
}

/// The orientation integer exactly as the device sent it
///
/// The device is not trusted to stay within the known orientations, so the
/// conversion to [`InterfaceOrientation`] is a separate, fallible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawInterfaceOrientation(pub i64);

impl RawInterfaceOrientation {
    /// The number exactly as the device sent it
    pub fn value(self) -> i64 {
        self.0
    }

    /// # Errors
    /// Returns `UnknownOrientation` for values outside 1 to 4
    pub fn typed(self) -> Result<InterfaceOrientation, UnknownOrientation> {
        InterfaceOrientation::try_from(self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown interface orientation {0}")]
pub struct UnknownOrientation(pub i64);

/// Which wallpaper a preview is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WallpaperName {
    HomeScreen,
    LockScreen,
}

impl WallpaperName {
    /// The `wallpaperName` value sent on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HomeScreen => "homescreen",
            Self::LockScreen => "lockscreen",
        }
    }
}

impl std::str::FromStr for WallpaperName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "homescreen" => Ok(Self::HomeScreen),
            "lockscreen" => Ok(Self::LockScreen),
            other => Err(format!("invalid wallpaper name `{other}`, use homescreen or lockscreen")),
        }
    }
}

/// A command failed; `context` names the operation
#[derive(Error, Debug)]
#[error("{context}: {source}")]
pub struct ClientError {
    pub context: Cow<'static, str>,
    #[source]
    pub source: ConnectionError,
}

impl ClientError {
    pub fn new(context: impl Into<Cow<'static, str>>, source: ConnectionError) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

/// A single command sent to the shim
///
/// `command` is always the first key. Envelopes are consumed by
/// [`SpringBoardServiceClient::execute`] and never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    inner: plist::Dictionary,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>) -> Self {
        let command: String = command.into();
        let inner = plist!({ "command": command })
            .into_dictionary()
            .unwrap_or_default();
        Self { inner }
    }

    /// Adds an operation parameter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<plist::Value>) -> Self {
        self.inner.insert(key.into(), value.into());
        self
    }

    /// The command name, the envelope's first key
    pub fn command(&self) -> &str {
        self.inner
            .get("command")
            .and_then(|x| x.as_string())
            .unwrap_or_default()
    }

    pub fn as_dictionary(&self) -> &plist::Dictionary {
        &self.inner
    }

    pub fn into_dictionary(self) -> plist::Dictionary {
        self.inner
    }
}

/// Client for the SpringBoard remote shim
///
/// Holds at most one connection, opened by the first command and reused by
/// every command after it. Commands on one client are serialized; the lock is
/// held across connection setup and both round trips.
#[derive(Debug)]
pub struct SpringBoardServiceClient<P: ServiceProvider> {
    provider: P,
    conn: Mutex<Option<ServiceConnection>>,
}

#[cfg(feature = "tcp")]
impl SpringBoardServiceClient<TcpProvider> {
    /// Creates a client for the shim at `address`, connecting over TCP
    pub fn new(address: impl Into<Address>) -> Self {
        Self::with_provider(TcpProvider::new(address))
    }
}

impl<P: ServiceProvider> SpringBoardServiceClient<P> {
    /// Name the shim is registered under in the RSD service list
    pub const RSD_SERVICE_NAME: &'static str = "com.apple.springboardservices.shim.remote";

    pub fn with_provider(provider: P) -> Self {
        Self {
            provider,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        self.provider.address()
    }

    /// Whether the first command has already opened the connection
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(Self::RSD_SERVICE_NAME, self.address().port)
    }

    /// Sends a raw command and returns the authoritative reply
    ///
    /// Errors are prefixed with `Failed to execute <command>`. The typed
    /// operations below use their own prefixes.
    pub async fn execute(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<plist::Dictionary, ClientError> {
        let context = format!("Failed to execute {}", envelope.command());
        self.send_request(envelope)
            .await
            .map_err(|e| ClientError::new(context, e))
    }

    async fn send_request(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<plist::Dictionary, ConnectionError> {
        let mut guard = self.conn.lock().await;
        let conn = match &mut *guard {
            Some(conn) => conn,
            slot => {
                debug!("Connecting to {} at {}", Self::RSD_SERVICE_NAME, self.address());
                let conn = start_lockdown_service(&self.provider, &self.service_config()).await?;
                slot.insert(conn)
            }
        };

        let request = envelope.into_dictionary();
        // The first reply is the StartService acknowledgement
        let res = match conn.send_and_receive(request.clone()).await {
            Ok(_) => conn.send_plist_request(request).await,
            Err(e) => Err(e),
        };
        if !conn.is_open() {
            debug!("Connection to {} closed, next command reconnects", Self::RSD_SERVICE_NAME);
            *guard = None;
        }
        res
    }

    /// Retrieves the home screen icon layout in format version 2
    pub async fn get_icon_state(&self) -> Result<plist::Dictionary, ClientError> {
        let req = CommandEnvelope::new("getIconState").with("formatVersion", "2");
        self.send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get Icon state", e))
    }

    /// Replaces the home screen icon layout
    ///
    /// An empty `new_state` is sent as an empty array. Dates are truncated to
    /// whole seconds first, since the device rejects finer precision.
    pub async fn set_icon_state(
        &self,
        new_state: Vec<plist::Dictionary>,
    ) -> Result<(), ClientError> {
        let mut icon_state = plist::Value::Array(
            new_state
                .into_iter()
                .map(plist::Value::Dictionary)
                .collect(),
        );
        truncate_dates_to_seconds(&mut icon_state);

        let req = CommandEnvelope::new("setIconState").with("iconState", icon_state);
        self.send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to set icon state", e))?;
        Ok(())
    }

    /// Retrieves the PNG icon of an installed app
    ///
    /// # Arguments
    /// * `bundle_id` - e.g. `com.apple.Preferences`
    ///
    /// # Returns
    /// The `pngData` of the reply, or `None` if the reply has none
    pub async fn get_icon_pngdata(
        &self,
        bundle_id: impl Into<String>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let req = CommandEnvelope::new("getIconPNGData")
            .with("bundleId", plist::Value::String(bundle_id.into()));
        let res = self
            .send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get Icon PNG data", e))?;
        Ok(take_png_data(res))
    }

    /// Retrieves metadata about a named wallpaper
    ///
    /// # Arguments
    /// * `wallpaper_name` - e.g. `homescreen`
    ///
    /// # Errors
    /// Returns `ClientError` prefixed `Failed to get wallpaper info`
    pub async fn get_wallpaper_info(
        &self,
        wallpaper_name: impl Into<String>,
    ) -> Result<plist::Dictionary, ClientError> {
        let req = CommandEnvelope::new("getWallpaperInfo")
            .with("wallpaperName", plist::Value::String(wallpaper_name.into()));
        self.send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get wallpaper info", e))
    }

    /// Retrieves a preview of the home screen or lock screen wallpaper
    pub async fn get_wallpaper_preview_image(
        &self,
        wallpaper_name: WallpaperName,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let req = CommandEnvelope::new("getWallpaperPreviewImage")
            .with("wallpaperName", wallpaper_name.as_str());
        let res = self
            .send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get wallpaper preview image", e))?;
        Ok(take_png_data(res))
    }

    /// Shorthand for [`Self::get_wallpaper_preview_image`] with `homescreen`
    pub async fn get_home_screen_wallpaper_preview_pngdata(
        &self,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        self.get_wallpaper_preview_image(WallpaperName::HomeScreen)
            .await
    }

    pub async fn get_lock_screen_wallpaper_preview_pngdata(
        &self,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        self.get_wallpaper_preview_image(WallpaperName::LockScreen)
            .await
    }

    /// Retrieves the icon grid metrics of the home screen
    pub async fn get_homescreen_icon_metrics(&self) -> Result<plist::Dictionary, ClientError> {
        let req = CommandEnvelope::new("getHomeScreenIconMetrics");
        self.send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get homescreen icon metrics", e))
    }

    /// Retrieves the current interface orientation
    ///
    /// The value is passed through unvalidated; call
    /// [`RawInterfaceOrientation::typed`] to interpret it.
    pub async fn get_interface_orientation(
        &self,
    ) -> Result<Option<RawInterfaceOrientation>, ClientError> {
        let req = CommandEnvelope::new("getInterfaceOrientation");
        let res = self
            .send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get interface orientation", e))?;

        let orientation = res.get("interfaceOrientation");
        let raw = orientation
            .and_then(|x| x.as_signed_integer())
            .map(RawInterfaceOrientation);
        if raw.is_none() && orientation.is_some() {
            warn!("interfaceOrientation is not an integer: {orientation:?}");
        }
        Ok(raw)
    }

    /// Retrieves the full wallpaper image by name
    ///
    /// The command is `getHomeScreenWallpaperPNGData` whatever the name.
    ///
    /// # Returns
    /// The `pngData` of the reply, or `None` if the reply has none
    ///
    /// # Errors
    /// Returns `ClientError` prefixed `Failed to get wallpaper PNG data`
    pub async fn get_wallpaper_pngdata(
        &self,
        wallpaper_name: impl Into<String>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let req = CommandEnvelope::new("getHomeScreenWallpaperPNGData")
            .with("wallpaperName", plist::Value::String(wallpaper_name.into()));
        let res = self
            .send_request(req)
            .await
            .map_err(|e| ClientError::new("Failed to get wallpaper PNG data", e))?;
        Ok(take_png_data(res))
    }
}

fn take_png_data(mut res: plist::Dictionary) -> Option<Vec<u8>> {
    match res.remove("pngData") {
        Some(plist::Value::Data(data)) => Some(data),
        Some(other) => {
            warn!("pngData is not data: {other:?}");
            None
        }
        None => None,
    }
}
