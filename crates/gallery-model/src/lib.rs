use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use connection::ConnectionState;
pub use identity::{ContentId, FilterId, ImageId};
pub use image::{DisplayOptions, Image, aspect_ratio};
pub use slideshow::{ActiveArt, SelectionPolicy, SlideshowConfig, UploadRecord};

mod identity {
    use super::*;

    macro_rules! string_id {
        ($(#[$meta:meta])* $name:ident) => {
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }
        };
    }

    string_id!(
        /// Stable identity of an image in the library (library-relative path).
        ImageId
    );
    string_id!(
        /// Device-side handle returned by a successful upload.
        ContentId
    );
    string_id!(
        /// Identity of a saved filter in the settings store.
        FilterId
    );
}

mod image {
    use super::*;

    /// Per-image presentation hints. Every field is optional; the device
    /// defaults apply when unset.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case", default)]
    pub struct DisplayOptions {
        /// Overrides the slideshow interval while this image is active.
        #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
        pub duration: Option<Duration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub matte: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Image {
        pub id: ImageId,
        pub path: PathBuf,
        pub filename: String,
        pub width: u32,
        pub height: u32,
        pub aspect_width: u32,
        pub aspect_height: u32,
        #[serde(default)]
        pub display: DisplayOptions,
    }

    impl Image {
        pub fn new(id: impl Into<ImageId>, path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
            let path = path.into();
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (aspect_width, aspect_height) = aspect_ratio(width, height);
            Self {
                id: id.into(),
                path,
                filename,
                width,
                height,
                aspect_width,
                aspect_height,
                display: DisplayOptions::default(),
            }
        }

        pub fn with_display(mut self, display: DisplayOptions) -> Self {
            self.display = display;
            self
        }

        /// Full path of the containing directory, as matched by directory filters.
        pub fn directory(&self) -> String {
            self.path
                .parent()
                .map(Path::to_string_lossy)
                .map(|dir| dir.into_owned())
                .unwrap_or_default()
        }

        pub fn is_widescreen(&self) -> bool {
            self.aspect_width == 16 && self.aspect_height == 9
        }
    }

    /// Reduce `width:height` by their greatest common divisor.
    pub fn aspect_ratio(width: u32, height: u32) -> (u32, u32) {
        fn gcd(mut a: u32, mut b: u32) -> u32 {
            while b != 0 {
                (a, b) = (b, a % b);
            }
            a
        }

        match gcd(width, height) {
            0 => (0, 0),
            divisor => (width / divisor, height / divisor),
        }
    }
}

mod slideshow {
    use super::*;

    /// How the scheduler picks the next image from the eligible set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum SelectionPolicy {
        /// Uniformly random among eligible images.
        #[default]
        Random,
        /// Identity order, continuing after the active image and wrapping.
        Sequential,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct SlideshowConfig {
        pub enabled: bool,
        #[serde(with = "humantime_serde")]
        pub interval: Duration,
        #[serde(default)]
        pub filter: Option<FilterId>,
    }

    impl Default for SlideshowConfig {
        fn default() -> Self {
            Self {
                enabled: false,
                interval: Duration::from_secs(5 * 60),
                filter: None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct UploadRecord {
        pub image_id: ImageId,
        pub content_id: ContentId,
        pub uploaded_at: DateTime<Utc>,
    }

    /// The image currently shown by the device and since when.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct ActiveArt {
        pub image_id: ImageId,
        pub since: DateTime<Utc>,
    }
}

mod connection {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(tag = "state", rename_all = "snake_case")]
    pub enum ConnectionState {
        #[default]
        Disconnected,
        Connecting,
        Connected,
        Reconnecting {
            attempt: u32,
            next_retry_at: DateTime<Utc>,
        },
        Failed {
            reason: String,
        },
    }

    impl ConnectionState {
        pub fn is_connected(&self) -> bool {
            matches!(self, ConnectionState::Connected)
        }

        pub fn label(&self) -> &'static str {
            match self {
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Connecting => "connecting",
                ConnectionState::Connected => "connected",
                ConnectionState::Reconnecting { .. } => "reconnecting",
                ConnectionState::Failed { .. } => "failed",
            }
        }
    }

    impl fmt::Display for ConnectionState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ConnectionState::Reconnecting {
                    attempt,
                    next_retry_at,
                } => write!(f, "reconnecting (attempt {attempt}, next at {next_retry_at})"),
                ConnectionState::Failed { reason } => write!(f, "failed: {reason}"),
                other => f.write_str(other.label()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratio_reduces_by_gcd() {
        assert_eq!(aspect_ratio(1920, 1080), (16, 9));
        assert_eq!(aspect_ratio(3000, 2000), (3, 2));
        assert_eq!(aspect_ratio(1000, 1000), (1, 1));
        assert_eq!(aspect_ratio(0, 0), (0, 0));
    }

    #[test]
    fn image_derives_filename_and_directory() {
        let image = Image::new("2024/kenya/img_001.jpg", "/photos/2024/kenya/img_001.jpg", 3840, 2160);
        assert_eq!(image.filename, "img_001.jpg");
        assert_eq!(image.directory(), "/photos/2024/kenya");
        assert!(image.is_widescreen());
    }

    #[test]
    fn connection_state_serializes_with_state_tag() {
        let json = serde_json::to_value(ConnectionState::Connected).expect("serialize");
        assert_eq!(json, serde_json::json!({ "state": "connected" }));

        let failed = ConnectionState::Failed {
            reason: "unauthorized".into(),
        };
        let json = serde_json::to_value(&failed).expect("serialize");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "unauthorized");
    }

    #[test]
    fn slideshow_config_parses_humantime_interval() {
        let cfg: SlideshowConfig = serde_yaml::from_str(
            r#"
enabled: true
interval: 30s
filter: "3"
"#,
        )
        .expect("parse slideshow config");
        assert!(cfg.enabled);
        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert_eq!(cfg.filter, Some(FilterId::new("3")));
    }

    #[test]
    fn display_options_default_when_absent() {
        let image: Image = serde_yaml::from_str(
            r#"
id: a.jpg
path: /photos/a.jpg
filename: a.jpg
width: 10
height: 10
aspect-width: 1
aspect-height: 1
"#,
        )
        .expect("parse image");
        assert_eq!(image.display, DisplayOptions::default());
    }
}
