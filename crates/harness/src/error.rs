//! Error types for the screenshot harness

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Browser session unavailable for {engine}: {reason}")]
    SessionUnavailable { engine: String, reason: String },

    #[error("Navigation to {url} timed out after {}ms", .timeout.as_millis())]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("Page not ready after {}ms waiting for {condition}", .waited.as_millis())]
    ReadinessTimeout { condition: String, waited: Duration },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Pointer path ({x}, {y}) leaves the {width}x{height} viewport")]
    OutOfViewport {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("Image dimensions differ: captured {captured:?} vs baseline {baseline:?}")]
    DimensionMismatch {
        captured: (u32, u32),
        baseline: (u32, u32),
    },

    #[error("No baseline for {case} at revision {revision}")]
    NoBaseline { case: String, revision: u32 },

    #[error("Baseline {case} revision {revision} already exists with different content ({})", .path.display())]
    BaselineWriteConflict {
        case: String,
        revision: u32,
        path: PathBuf,
    },

    #[error("Case {case} exceeded its {}ms budget", .timeout.as_millis())]
    CaseTimeout { case: String, timeout: Duration },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid case transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Suite parse error: {0}")]
    SuiteParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("WebDriver error: {0}")]
    WebDriver(#[from] thirtyfour::error::WebDriverError),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
