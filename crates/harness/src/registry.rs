//! Declarative YAML suites and case generation

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::case::{CaseId, Viewport};
use crate::driver::Engine;
use crate::error::{HarnessError, HarnessResult};

/// A suite of screenshot scenarios for one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    /// Suite name, used as the first identity tag when `tags` is empty
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Leading identity tags shared by every case
    #[serde(default)]
    pub tags: Vec<String>,

    /// Page path, relative to the runner's base URL, or an absolute URL
    pub url: String,

    #[serde(default)]
    pub viewport: Viewport,

    /// Script returning `true` once the page has settled
    #[serde(default)]
    pub ready_script: Option<String>,

    /// Settle delay used when no readiness script is declared
    #[serde(default)]
    pub settle_ms: Option<u64>,

    /// Engines every scenario runs on
    pub engines: Vec<Engine>,

    pub scenarios: Vec<ScenarioSpec>,
}

/// One assertion: optional interaction followed by a capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,

    /// Baseline revision to compare against
    #[serde(default = "default_revision")]
    pub revision: u32,

    /// Allowed fraction of differing pixels; the configured default otherwise
    #[serde(default)]
    pub tolerance: Option<f64>,

    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

fn default_revision() -> u32 {
    1
}

/// Something done between load and capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Drag an element by an offset
    Drag {
        selector: String,
        dx: i64,
        dy: i64,
        /// Interpolated moves; the configured default otherwise
        #[serde(default)]
        steps: Option<u32>,
    },

    /// Wait for readiness again
    Wait {
        #[serde(default)]
        script: Option<String>,
        /// Fallback delay, only used when no script applies
        #[serde(default)]
        settle_ms: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// A fully resolved case, ready to hand to the runner
#[derive(Debug, Clone)]
pub struct CaseDefinition {
    pub id: CaseId,
    pub suite: String,
    pub scenario: String,
    pub engine: Engine,
    pub url: String,
    pub viewport: Viewport,
    pub ready_script: Option<String>,
    pub settle: Option<Duration>,
    pub revision: u32,
    pub tolerance: Option<f64>,
    pub steps: Vec<ScenarioStep>,
}

impl SuiteSpec {
    /// Parse a suite from YAML
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let suite: Self = serde_yaml::from_str(yaml)?;
        suite.validate()?;
        Ok(suite)
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            HarnessError::SuiteParse(msg) => {
                HarnessError::SuiteParse(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Load every suite under a directory, in path order
    pub fn load_all(dir: &Path) -> HarnessResult<Vec<Self>> {
        let mut suites = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            suites.push(Self::from_file(entry.path())?);
        }

        Ok(suites)
    }

    /// Suites carrying `tag`
    pub fn filter_by_tag<'a>(suites: &'a [Self], tag: &str) -> Vec<&'a Self> {
        suites
            .iter()
            .filter(|s| s.identity_tags().iter().any(|t| t == tag))
            .collect()
    }

    fn identity_tags(&self) -> Vec<String> {
        if self.tags.is_empty() {
            vec![self.name.clone()]
        } else {
            self.tags.clone()
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.engines.is_empty() {
            return Err(HarnessError::SuiteParse(format!(
                "suite '{}' lists no engines",
                self.name
            )));
        }
        if self.scenarios.is_empty() {
            return Err(HarnessError::SuiteParse(format!(
                "suite '{}' has no scenarios",
                self.name
            )));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(HarnessError::SuiteParse(format!(
                "suite '{}' has an empty viewport",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(HarnessError::SuiteParse(format!(
                    "duplicate scenario '{}' in suite '{}'",
                    scenario.name, self.name
                )));
            }
            if let Some(t) = scenario.tolerance {
                if !(0.0..=1.0).contains(&t) {
                    return Err(HarnessError::SuiteParse(format!(
                        "scenario '{}' tolerance {} is outside 0..=1",
                        scenario.name, t
                    )));
                }
            }
        }

        let mut engines = HashSet::new();
        if let Some(dup) = self.engines.iter().find(|e| !engines.insert(**e)) {
            return Err(HarnessError::SuiteParse(format!(
                "engine '{}' listed twice in suite '{}'",
                dup, self.name
            )));
        }

        Ok(())
    }

    /// Cartesian product of scenarios and engines, in declaration order
    /// (scenario-major).
    pub fn cases(&self) -> HarnessResult<Vec<CaseDefinition>> {
        let mut cases = Vec::with_capacity(self.scenarios.len() * self.engines.len());

        for scenario in &self.scenarios {
            for engine in &self.engines {
                let mut tags = self.identity_tags();
                tags.push(scenario.name.clone());
                tags.push(engine.to_string());

                cases.push(CaseDefinition {
                    id: CaseId::new(tags)?,
                    suite: self.name.clone(),
                    scenario: scenario.name.clone(),
                    engine: *engine,
                    url: self.url.clone(),
                    viewport: self.viewport,
                    ready_script: self.ready_script.clone(),
                    settle: self.settle_ms.map(Duration::from_millis),
                    revision: scenario.revision,
                    tolerance: scenario.tolerance,
                    steps: scenario.steps.clone(),
                });
            }
        }

        Ok(cases)
    }
}

/// Join a suite page path onto the base URL. Absolute URLs pass through.
pub fn resolve_url(base: &str, page: &str) -> String {
    if page.contains("://") {
        return page.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        page.trim_start_matches('/')
    )
}
