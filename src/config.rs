use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use gallery_model::SelectionPolicy;
use serde::Deserialize;

use crate::cleanup::CleanupOptions;
use crate::device::{BackoffPolicy, LinkOptions};
use crate::scheduler::SchedulerOptions;
use crate::upload::UploadOptions;

/// Device content category holding user uploads.
pub const DEFAULT_CATEGORY: &str = "MY-C0002";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// The frame's WebSocket art channel.
    #[default]
    Websocket,
    /// In-process scripted device, for demos and development.
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub host: String,
    pub port: u16,
    /// Name the device shows when asking to pair.
    pub client_name: String,
    /// Pairing token file; relative paths live under `state-dir`.
    pub token_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_timeout: Duration,
    pub content_category: String,
    pub backoff: BackoffPolicy,
}

impl DeviceConfig {
    const fn default_port() -> u16 {
        8001
    }

    const fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_command_timeout() -> Duration {
        Duration::from_secs(15)
    }

    const fn default_upload_timeout() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_health_interval() -> Duration {
        Duration::from_secs(20)
    }

    const fn default_health_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn validate(&self) -> Result<()> {
        if self.kind == DeviceKind::Websocket {
            ensure!(
                !self.host.trim().is_empty(),
                "device.host is required for the websocket device"
            );
        }
        ensure!(self.port > 0, "device.port must be greater than zero");
        ensure!(
            !self.client_name.trim().is_empty(),
            "device.client-name must not be empty"
        );
        for (name, value) in [
            ("connect-timeout", self.connect_timeout),
            ("command-timeout", self.command_timeout),
            ("upload-timeout", self.upload_timeout),
            ("health-interval", self.health_interval),
            ("health-timeout", self.health_timeout),
        ] {
            ensure!(value > Duration::ZERO, "device.{name} must be positive");
        }
        ensure!(
            self.health_timeout < self.health_interval,
            "device.health-timeout must be shorter than device.health-interval"
        );
        ensure!(
            !self.content_category.is_empty(),
            "device.content-category must not be empty"
        );
        self.backoff.validate()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::default(),
            host: String::new(),
            port: Self::default_port(),
            client_name: "frame-gallery".to_string(),
            token_path: PathBuf::from("device-token"),
            connect_timeout: Self::default_connect_timeout(),
            command_timeout: Self::default_command_timeout(),
            upload_timeout: Self::default_upload_timeout(),
            health_interval: Self::default_health_interval(),
            health_timeout: Self::default_health_timeout(),
            content_category: DEFAULT_CATEGORY.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LibraryConfig {
    /// Root directory scanned recursively for images.
    pub path: PathBuf,
    /// Follow filesystem changes after the initial scan.
    pub watch: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SlideshowSection {
    pub selection: SelectionPolicy,
    pub seed: Option<u64>,
    pub fire_on_enable: bool,
    /// Interval used until one is stored in the settings.
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
}

impl Default for SlideshowSection {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::default(),
            seed: None,
            fire_on_enable: false,
            default_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest is dropped.
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CleanupConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub keep: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            keep: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WebConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl WebConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub device: DeviceConfig,
    pub library: LibraryConfig,
    /// Directory for the settings document, upload cache and pairing token.
    pub state_dir: PathBuf,
    pub slideshow: SlideshowSection,
    pub events: EventsConfig,
    pub cleanup: CleanupConfig,
    pub web: WebConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            library: LibraryConfig::default(),
            state_dir: PathBuf::from("/var/lib/frame-gallery"),
            slideshow: SlideshowSection::default(),
            events: EventsConfig::default(),
            cleanup: CleanupConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_yaml::from_str(&s)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.library.path.as_os_str().is_empty(),
            "library.path is required"
        );
        ensure!(
            !self.state_dir.as_os_str().is_empty(),
            "state-dir must not be empty"
        );
        self.device.validate()?;
        ensure!(
            self.slideshow.default_interval >= Duration::from_secs(1),
            "slideshow.default-interval must be at least one second"
        );
        ensure!(
            self.events.queue_capacity > 0,
            "events.queue-capacity must be greater than zero"
        );
        ensure!(
            self.events.heartbeat_interval > Duration::ZERO,
            "events.heartbeat-interval must be positive"
        );
        ensure!(
            self.cleanup.interval > Duration::ZERO,
            "cleanup.interval must be positive"
        );
        Ok(self)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.state_dir.join("settings.json")
    }

    pub fn upload_cache_path(&self) -> PathBuf {
        self.state_dir.join("uploads.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.state_dir.join(&self.device.token_path)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            client_name: self.device.client_name.clone(),
            token_path: Some(self.token_path()),
            connect_timeout: self.device.connect_timeout,
            health_interval: self.device.health_interval,
            health_timeout: self.device.health_timeout,
            backoff: self.device.backoff.clone(),
            backoff_seed: None,
        }
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            timeout: self.device.upload_timeout,
            category: self.device.content_category.clone(),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            selection: self.slideshow.selection,
            seed: self.slideshow.seed,
            fire_on_enable: self.slideshow.fire_on_enable,
            command_timeout: self.device.command_timeout,
            category: self.device.content_category.clone(),
        }
    }

    pub fn cleanup_options(&self) -> CleanupOptions {
        CleanupOptions {
            interval: self.cleanup.interval,
            keep: self.cleanup.keep,
            category: self.device.content_category.clone(),
            command_timeout: self.device.command_timeout,
            ..CleanupOptions::default()
        }
    }
}
