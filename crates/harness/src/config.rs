//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::Engine;
use crate::error::{HarnessError, HarnessResult};

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Artifact locations
    pub artifacts: ArtifactConfig,

    /// Image comparison
    pub comparison: ComparisonConfig,

    /// Readiness synchronization
    pub readiness: ReadinessConfig,

    /// Case execution
    pub runner: RunnerConfig,

    /// Per-engine driver settings, keyed by engine name
    pub engines: BTreeMap<Engine, EngineConfig>,
}

/// Where baselines, diffs and the run summary live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root of the baseline store
    pub baseline_root: PathBuf,

    /// JSON run summary written after each suite
    pub summary_path: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            baseline_root: PathBuf::from("test-results/baselines"),
            summary_path: PathBuf::from("test-results/summary.json"),
        }
    }
}

/// Image comparison settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Default allowed fraction of differing pixels (0.0 - 1.0)
    pub tolerance: f64,

    /// Per-channel difference a pixel may have before it counts as differing
    pub pixel_threshold: u8,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            pixel_threshold: 5,
        }
    }
}

/// Readiness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Upper bound for one readiness wait
    pub timeout_ms: u64,

    /// Fixed delay used when the page exposes no readiness predicate
    pub settle_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            settle_ms: 1_000,
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Case execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base URL that suite page paths are joined onto
    pub base_url: String,

    /// Budget for one case, from session open to verdict
    pub case_timeout_ms: u64,

    /// Engine lanes allowed to run at the same time
    pub max_parallel_engines: usize,

    /// Record a baseline when none exists for the requested revision
    pub record_missing: bool,

    /// Overwrite existing baselines with the new capture
    pub force_update: bool,

    /// Intermediate pointer moves emitted for a drag
    pub drag_steps: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8082/examples".to_string(),
            case_timeout_ms: 120_000,
            max_parallel_engines: 2,
            record_missing: true,
            force_update: false,
            drag_steps: 10,
        }
    }
}

impl RunnerConfig {
    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }
}

/// How to reach one browser engine's WebDriver endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Driver binary (geckodriver, chromedriver); `None` uses the engine default
    pub driver_path: Option<PathBuf>,

    /// Port for the spawned driver (None = find free port)
    pub port: Option<u16>,

    /// Connect to an already running endpoint instead of spawning a driver
    pub remote_url: Option<String>,

    /// Run the browser headless
    pub headless: bool,

    /// Extra browser command-line arguments
    pub args: Vec<String>,

    /// Time allowed for the driver to answer `/status`
    pub startup_timeout_ms: u64,

    /// Page load timeout for navigation
    pub navigation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver_path: None,
            port: None,
            remote_url: None,
            headless: true,
            args: Vec::new(),
            startup_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Driver settings for an engine, defaults when not configured
    pub fn engine(&self, engine: Engine) -> EngineConfig {
        self.engines.get(&engine).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> HarnessResult<()> {
        let tolerance = self.comparison.tolerance;
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(HarnessError::Config(format!(
                "comparison.tolerance must be within 0.0..=1.0, got {}",
                tolerance
            )));
        }
        if self.readiness.timeout_ms == 0 {
            return Err(HarnessError::Config(
                "readiness.timeout_ms must be positive".to_string(),
            ));
        }
        if self.runner.max_parallel_engines == 0 {
            return Err(HarnessError::Config(
                "runner.max_parallel_engines must be at least 1".to_string(),
            ));
        }
        if self.runner.drag_steps < 2 {
            return Err(HarnessError::Config(
                "runner.drag_steps must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.comparison.tolerance, 0.001);
        assert_eq!(config.comparison.pixel_threshold, 5);
        assert!(config.runner.record_missing);
        assert!(!config.runner.force_update);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.readiness.timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_toml_and_engine_sections() {
        let toml = r#"
[comparison]
tolerance = 0.01

[engines.chrome]
driver_path = "/usr/local/bin/chromedriver"
args = ["--hide-scrollbars"]

[engines.firefox]
remote_url = "http://127.0.0.1:4444"
"#;
        let config: HarnessConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.comparison.tolerance, 0.01);
        assert_eq!(config.comparison.pixel_threshold, 5);
        assert_eq!(
            config.engine(Engine::Chrome).args,
            vec!["--hide-scrollbars".to_string()]
        );
        assert_eq!(
            config.engine(Engine::Firefox).remote_url.as_deref(),
            Some("http://127.0.0.1:4444")
        );
        assert!(config.engine(Engine::Firefox).headless);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/mapshot.toml");
        let mut config = HarnessConfig::default();
        config.runner.force_update = true;
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert!(loaded.runner.force_update);
    }

    #[test]
    fn test_rejects_out_of_range_tolerance() {
        let mut config = HarnessConfig::default();
        config.comparison.tolerance = 1.5;
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }
}
