// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing file, a missing section or a
// missing key all fall back quietly. A file that fails to parse or to
// validate is reported and replaced by the defaults.

use anyhow::{anyhow, ensure, Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Presenter".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frames_in_flight: 2,
        }
    }
}

/// Where the precompiled vertex.spirv / fragment.spirv live
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: false,
            log_level: "info".to_string(),
            log_file: None,
            show_fps: true,
        }
    }
}

impl DebugConfig {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow!("Unknown log level '{}'", self.log_level))
    }
}

impl Config {
    /// Load config.toml from the working directory, falling back to defaults
    ///
    /// Runs before logging is set up, so problems go to stderr.
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_PATH).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {:#}. Using defaults.", DEFAULT_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.graphics.frames_in_flight >= 1,
            "graphics.frames_in_flight must be at least 1"
        );
        ensure!(
            self.window.width > 0 && self.window.height > 0,
            "window size must be non-zero, got {}x{}",
            self.window.width,
            self.window.height
        );
        self.debug.level_filter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.window.title, "Quad Presenter");
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.shaders.directory, Path::new("shaders"));
        assert!(!config.debug.validation_layers);
        assert_eq!(config.debug.log_file, None);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            frames_in_flight = 3

            [debug]
            log_level = "debug"
            log_file = "quad.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.debug.level_filter().unwrap(), LevelFilter::Debug);
        assert_eq!(config.debug.log_file.as_deref(), Some(Path::new("quad.log")));
        assert!(config.debug.show_fps);
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = Config::parse("[graphics]\nframes_in_flight = 0\n").unwrap_err();
        assert!(err.to_string().contains("frames_in_flight"));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(Config::parse("[debug]\nlog_level = \"loud\"\n").is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::parse("[window\nwidth = 1").is_err());
        assert!(Config::parse("[window]\nwidth = \"wide\"\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bundled_config_parses() {
        let config = Config::load_from_path(Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_PATH))
            .unwrap();
        assert!(config.graphics.frames_in_flight >= 1);
    }
}
