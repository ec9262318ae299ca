//! Frame synchronization between an asynchronous capture/playback card and a
//! polling consumer such as a render loop.

pub mod capture;
pub mod device;
pub mod error;
pub mod loopback;
pub mod modes;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureChannel, Frame, PixelFormat, TimecodeBundle};
pub use device::{DeckDevice, DeviceContext, DeviceEvent};
pub use error::{Error, HardwareError, Result};
pub use modes::{DisplayMode, DisplayModeId, ModeCatalog, Resolution};
pub use output::OutputChannel;

/// Environment variable prefix for configuration overrides, e.g.
/// `DECKBRIDGE__CAPTURE__MODE_INDEX=3`.
pub const ENV_PREFIX: &str = "DECKBRIDGE";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sub-device index to open; auto-detected when unset
    pub device_index: Option<i64>,
    /// Position in the device's display mode list
    pub mode_index: i64,
    pub format_detection: bool,
    /// Convert to `target_format` on arrival instead of storing native bytes
    pub convert: bool,
    pub target_format: PixelFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            mode_index: 0,
            format_detection: true,
            convert: true,
            target_format: PixelFormat::Bgra8Bit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub mode: DisplayModeId,
    pub pixel_format: PixelFormat,
    /// Flip created frames vertically (bottom-up sources such as GL readback)
    pub flip_vertical: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DisplayModeId::HD1080P30,
            pixel_format: PixelFormat::Bgra8Bit,
            flip_vertical: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "deckbridge=info".into(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `DECKBRIDGE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(path.map(|p| config::File::from(p).required(true)))
    }

    /// Defaults overlaid with a TOML document, then the environment.
    pub fn from_toml(document: &str) -> Result<Self> {
        Self::layered(Some(config::File::from_str(
            document,
            config::FileFormat::Toml,
        )))
    }

    fn layered<S>(file: Option<S>) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.capture.mode_index, 0);
        assert!(!config.output.enabled);
        assert_eq!(config.logging.filter, "deckbridge=info");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            [capture]
            device_index = 2
            convert = false

            [output]
            enabled = true
            mode = "pal "
            flip_vertical = true
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.device_index, Some(2));
        assert!(!config.capture.convert);
        assert!(config.capture.format_detection);
        assert!(config.output.enabled);
        assert_eq!(config.output.mode, DisplayModeId::PAL);
        assert!(config.output.flip_vertical);
        assert_eq!(config.output.pixel_format, PixelFormat::Bgra8Bit);
    }

    #[test]
    fn test_bad_mode_code_rejected() {
        let err = Config::from_toml("[output]\nmode = \"1080p\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/deckbridge.toml"))).is_err());
    }
}
