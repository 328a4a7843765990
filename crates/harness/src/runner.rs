//! Case runner: drives each case through load, interaction, capture and
//! comparison, one fresh browser session per case.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::baseline::BaselineStore;
use crate::case::CaseId;
use crate::compare::{Comparator, ComparisonResult, Verdict};
use crate::config::HarnessConfig;
use crate::driver::{capture, BrowserSession, Engine, SessionFactory};
use crate::error::{HarnessError, HarnessResult};
use crate::interaction::{self, InteractionIntent};
use crate::readiness::{wait_until_ready, ReadinessCondition};
use crate::registry::{resolve_url, CaseDefinition, ScenarioStep, SuiteSpec};

/// Where a case is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    Loading,
    Interacting,
    Capturing,
    Comparing,
    Passed,
    Failed,
    Errored,
    Recorded,
}

impl CaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaseState::Passed | CaseState::Failed | CaseState::Errored | CaseState::Recorded
        )
    }

    pub fn can_transition_to(self, next: CaseState) -> bool {
        use CaseState::*;

        if next == Errored {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Loading)
                | (Loading, Interacting)
                | (Loading, Capturing)
                | (Interacting, Capturing)
                | (Capturing, Comparing)
                | (Comparing, Passed)
                | (Comparing, Failed)
                | (Comparing, Recorded)
        )
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaseState::Pending => "pending",
            CaseState::Loading => "loading",
            CaseState::Interacting => "interacting",
            CaseState::Capturing => "capturing",
            CaseState::Comparing => "comparing",
            CaseState::Passed => "passed",
            CaseState::Failed => "failed",
            CaseState::Errored => "errored",
            CaseState::Recorded => "recorded",
        };
        f.write_str(name)
    }
}

/// Validated state machine for one case
#[derive(Debug, Clone)]
pub struct CaseTracker {
    state: CaseState,
    history: Vec<CaseState>,
}

impl Default for CaseTracker {
    fn default() -> Self {
        Self {
            state: CaseState::Pending,
            history: vec![CaseState::Pending],
        }
    }
}

impl CaseTracker {
    pub fn state(&self) -> CaseState {
        self.state
    }

    /// States visited so far, starting with `Pending`
    pub fn history(&self) -> &[CaseState] {
        &self.history
    }

    pub fn advance(&mut self, next: CaseState) -> HarnessResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HarnessError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Final classification of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed,
    Errored,
    Recorded,
}

impl From<CaseOutcome> for CaseState {
    fn from(outcome: CaseOutcome) -> Self {
        match outcome {
            CaseOutcome::Passed => CaseState::Passed,
            CaseOutcome::Failed => CaseState::Failed,
            CaseOutcome::Errored => CaseState::Errored,
            CaseOutcome::Recorded => CaseState::Recorded,
        }
    }
}

/// Result of running a single case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: CaseId,
    pub engine: Engine,
    pub scenario: String,
    pub revision: u32,
    pub outcome: CaseOutcome,
    pub duration_ms: u64,
    pub comparison: Option<ComparisonResult>,
    pub actual_path: Option<PathBuf>,
    /// Diagnostic for failed and errored cases
    pub error: Option<String>,
    pub states: Vec<CaseState>,
}

/// Result of running a suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub recorded: usize,
    pub duration_ms: u64,
    pub cases: Vec<CaseReport>,
}

impl SuiteSummary {
    fn from_reports(
        suite: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        cases: Vec<CaseReport>,
    ) -> Self {
        let count = |o: CaseOutcome| cases.iter().filter(|c| c.outcome == o).count();
        Self {
            suite: suite.to_string(),
            started_at,
            total: cases.len(),
            passed: count(CaseOutcome::Passed),
            failed: count(CaseOutcome::Failed),
            errored: count(CaseOutcome::Errored),
            recorded: count(CaseOutcome::Recorded),
            duration_ms: duration.as_millis() as u64,
            cases,
        }
    }

    /// No case failed or errored
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    pub fn report(&self, case: &CaseId) -> Option<&CaseReport> {
        self.cases.iter().find(|c| &c.case == case)
    }
}

/// What a case produced when it ran to a verdict
struct Execution {
    outcome: CaseOutcome,
    comparison: Option<ComparisonResult>,
    actual_path: Option<PathBuf>,
    detail: Option<String>,
}

/// Runs suites against a session factory
#[derive(Clone)]
pub struct Runner {
    config: HarnessConfig,
    factory: Arc<dyn SessionFactory>,
    store: BaselineStore,
    comparator: Comparator,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(config: HarnessConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let store = BaselineStore::new(&config.artifacts.baseline_root);
        let comparator = Comparator::new(config.comparison.pixel_threshold);
        Self {
            config,
            factory,
            store,
            comparator,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: BaselineStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    /// Token that aborts every running and pending case
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run several suites one after another
    pub async fn run_all(&self, suites: &[SuiteSpec]) -> HarnessResult<Vec<SuiteSummary>> {
        let mut summaries = Vec::with_capacity(suites.len());
        for suite in suites {
            summaries.push(self.run_suite(suite).await?);
        }
        Ok(summaries)
    }

    /// Run every case of `suite`.
    ///
    /// Cases of one engine run in order on their own lane; lanes run in
    /// parallel up to `max_parallel_engines`. Reports keep declaration order.
    pub async fn run_suite(&self, suite: &SuiteSpec) -> HarnessResult<SuiteSummary> {
        let cases = suite.cases()?;
        let started_at = Utc::now();
        let start = Instant::now();

        info!("Running suite {} ({} case(s))...", suite.name, cases.len());

        let mut lanes: BTreeMap<Engine, Vec<(usize, CaseDefinition)>> = BTreeMap::new();
        for (index, case) in cases.iter().enumerate() {
            lanes
                .entry(case.engine)
                .or_default()
                .push((index, case.clone()));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.runner.max_parallel_engines.max(1)));
        let mut set = JoinSet::new();

        for (engine, lane) in lanes {
            let runner = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let mut reports = Vec::with_capacity(lane.len());
                    for (index, case) in lane {
                        reports.push((index, runner.run_case(&case).await));
                    }
                    reports
                }
                .instrument(info_span!("lane", %engine)),
            );
        }

        let mut slots: Vec<Option<CaseReport>> = vec![None; cases.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(reports) => {
                    for (index, report) in reports {
                        slots[index] = Some(report);
                    }
                }
                Err(e) => error!("Engine lane aborted: {}", e),
            }
        }

        let reports: Vec<CaseReport> = slots
            .into_iter()
            .zip(&cases)
            .map(|(slot, case)| {
                slot.unwrap_or_else(|| {
                    errored_report(case, Duration::ZERO, vec![CaseState::Pending], "engine lane aborted")
                })
            })
            .collect();

        let summary = SuiteSummary::from_reports(&suite.name, started_at, start.elapsed(), reports);

        info!("");
        info!(
            "Suite {}: {} passed, {} failed, {} errored, {} recorded ({} ms)",
            summary.suite,
            summary.passed,
            summary.failed,
            summary.errored,
            summary.recorded,
            summary.duration_ms
        );

        Ok(summary)
    }

    /// Run one case to a verdict. Never fails: every problem becomes part of
    /// the report. The session is closed on every path.
    pub async fn run_case(&self, case: &CaseDefinition) -> CaseReport {
        let span = info_span!("case", case = %case.id, engine = %case.engine);
        self.run_case_inner(case).instrument(span).await
    }

    async fn run_case_inner(&self, case: &CaseDefinition) -> CaseReport {
        let start = Instant::now();
        let mut tracker = CaseTracker::default();
        let mut session: Option<Box<dyn BrowserSession>> = None;
        let budget = self.config.runner.case_timeout();

        let result = if self.cancel.is_cancelled() {
            Err(HarnessError::Cancelled)
        } else {
            tokio::select! {
                r = tokio::time::timeout(budget, self.execute(case, &mut session, &mut tracker)) => {
                    r.unwrap_or_else(|_| Err(HarnessError::CaseTimeout {
                        case: case.id.label(),
                        timeout: budget,
                    }))
                }
                _ = self.cancel.cancelled() => Err(HarnessError::Cancelled),
            }
        };

        if let Some(mut session) = session.take() {
            if let Err(e) = session.close().await {
                warn!("Failed to close {} session: {}", case.engine, e);
            }
        }

        let duration = start.elapsed();
        match result {
            Ok(execution) => {
                // Transitions were validated inside `execute`
                match execution.outcome {
                    CaseOutcome::Passed => {
                        info!("✓ {} ({} ms)", case.id, duration.as_millis())
                    }
                    CaseOutcome::Recorded => info!(
                        "● {} recorded baseline rev {} ({} ms)",
                        case.id,
                        case.revision,
                        duration.as_millis()
                    ),
                    _ => error!(
                        "✗ {} - {}",
                        case.id,
                        execution.detail.as_deref().unwrap_or("visual regression")
                    ),
                }
                CaseReport {
                    case: case.id.clone(),
                    engine: case.engine,
                    scenario: case.scenario.clone(),
                    revision: case.revision,
                    outcome: execution.outcome,
                    duration_ms: duration.as_millis() as u64,
                    comparison: execution.comparison,
                    actual_path: execution.actual_path,
                    error: execution.detail,
                    states: tracker.history().to_vec(),
                }
            }
            Err(e) => {
                error!("✗ {} - {}", case.id, e);
                if tracker.advance(CaseState::Errored).is_err() {
                    debug!("Case {} already terminal at {}", case.id, tracker.state());
                }
                errored_report(case, duration, tracker.history().to_vec(), &e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        case: &CaseDefinition,
        slot: &mut Option<Box<dyn BrowserSession>>,
        tracker: &mut CaseTracker,
    ) -> HarnessResult<Execution> {
        tracker.advance(CaseState::Loading)?;

        let session = slot.insert(self.factory.open(case.engine, case.viewport).await?);
        let url = resolve_url(&self.config.runner.base_url, &case.url);
        session.navigate(&url).await?;

        let settle = case.settle.unwrap_or_else(|| self.config.readiness.settle());
        let condition = ReadinessCondition::resolve(case.ready_script.as_deref(), settle);
        let timeout = self.config.readiness.timeout();
        let waited = wait_until_ready(session.as_mut(), &condition, timeout, &self.cancel).await?;
        debug!("Loaded {} in {} ms", url, waited.as_millis());

        let mut unsettled = false;
        for step in &case.steps {
            match step {
                ScenarioStep::Drag {
                    selector,
                    dx,
                    dy,
                    steps,
                } => {
                    if tracker.state() != CaseState::Interacting {
                        tracker.advance(CaseState::Interacting)?;
                    }
                    let intent = InteractionIntent::drag(selector.clone(), *dx, *dy)
                        .with_steps(steps.unwrap_or(self.config.runner.drag_steps));
                    interaction::perform(session.as_mut(), &intent).await?;
                    unsettled = true;
                }
                ScenarioStep::Wait {
                    script,
                    settle_ms,
                    timeout_ms,
                } => {
                    let step_condition = ReadinessCondition::resolve(
                        script.as_deref().or(case.ready_script.as_deref()),
                        settle_ms.map(Duration::from_millis).unwrap_or(settle),
                    );
                    let step_timeout = timeout_ms.map(Duration::from_millis).unwrap_or(timeout);
                    wait_until_ready(session.as_mut(), &step_condition, step_timeout, &self.cancel)
                        .await?;
                    unsettled = false;
                }
            }
        }

        // Never capture straight after an interaction
        if unsettled {
            wait_until_ready(session.as_mut(), &condition, timeout, &self.cancel).await?;
        }

        tracker.advance(CaseState::Capturing)?;
        let screenshot = capture(session.as_mut(), &case.id).await?;
        let actual_path = self
            .store
            .write_actual(&case.id, case.revision, &screenshot.image)
            .await?;

        tracker.advance(CaseState::Comparing)?;

        if self.config.runner.force_update {
            let outcome = self
                .store
                .put(&case.id, case.revision, &screenshot.image, true)
                .await?;
            info!("Force-updated baseline {} rev {}: {:?}", case.id, case.revision, outcome);
            tracker.advance(CaseState::Recorded)?;
            return Ok(Execution {
                outcome: CaseOutcome::Recorded,
                comparison: None,
                actual_path: Some(actual_path),
                detail: None,
            });
        }

        let baseline = match self.store.get(&case.id, case.revision).await {
            Ok(entry) => Some(entry),
            Err(HarnessError::NoBaseline { .. }) => None,
            Err(e) => return Err(e),
        };

        let tolerance = case.tolerance.unwrap_or(self.config.comparison.tolerance);
        let comparison = self
            .comparator
            .compare(
                &screenshot,
                baseline.as_ref().map(|b| &b.image),
                tolerance,
                &self.store.diff_path(&case.id, case.revision),
            )
            .await?;

        let (outcome, detail) = match comparison.verdict {
            Verdict::Pass => (CaseOutcome::Passed, None),
            Verdict::Fail => {
                let detail = comparison.detail.clone().unwrap_or_else(|| {
                    format!(
                        "{:.4} of pixels differ (tolerance {:.4})",
                        comparison.difference_ratio, tolerance
                    )
                });
                (CaseOutcome::Failed, Some(detail))
            }
            Verdict::NoBaseline if self.config.runner.record_missing => {
                self.store
                    .put(&case.id, case.revision, &screenshot.image, false)
                    .await?;
                (CaseOutcome::Recorded, None)
            }
            Verdict::NoBaseline => (
                CaseOutcome::Failed,
                Some(format!(
                    "no baseline for revision {} and recording is disabled",
                    case.revision
                )),
            ),
        };

        tracker.advance(outcome.into())?;
        Ok(Execution {
            outcome,
            comparison: Some(comparison),
            actual_path: Some(actual_path),
            detail,
        })
    }

    /// Default summary location from the configuration
    pub fn summary_path(&self) -> &Path {
        &self.config.artifacts.summary_path
    }

    /// Write a suite summary as pretty JSON
    pub fn write_summary(&self, summary: &SuiteSummary, path: &Path) -> HarnessResult<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path.to_path_buf())
    }
}

fn errored_report(
    case: &CaseDefinition,
    duration: Duration,
    states: Vec<CaseState>,
    error: &str,
) -> CaseReport {
    CaseReport {
        case: case.id.clone(),
        engine: case.engine,
        scenario: case.scenario.clone(),
        revision: case.revision,
        outcome: CaseOutcome::Errored,
        duration_ms: duration.as_millis() as u64,
        comparison: None,
        actual_path: None,
        error: Some(error.to_string()),
        states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{PageModel, SimulatedFactory, DEFAULT_READY_SCRIPT};
    use test_case::test_case;

    #[test_case(CaseState::Pending, CaseState::Loading, true ; "start")]
    #[test_case(CaseState::Loading, CaseState::Capturing, true ; "skip interaction")]
    #[test_case(CaseState::Comparing, CaseState::Recorded, true ; "record")]
    #[test_case(CaseState::Capturing, CaseState::Errored, true ; "error mid case")]
    #[test_case(CaseState::Pending, CaseState::Capturing, false ; "capture before load")]
    #[test_case(CaseState::Passed, CaseState::Errored, false ; "terminal is final")]
    #[test_case(CaseState::Interacting, CaseState::Loading, false ; "backwards")]
    fn test_transitions(from: CaseState, to: CaseState, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_tracker_rejects_illegal_transition() {
        let mut tracker = CaseTracker::default();
        let err = tracker.advance(CaseState::Comparing).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTransition { .. }));
        assert_eq!(tracker.state(), CaseState::Pending);
    }

    fn suite(extra_steps: &str) -> SuiteSpec {
        let yaml = format!(
            r##"
name: osmLayer
tags: [osmLayer]
url: osmLayer/index.html
ready_script: "{}"
engines: [firefox, chrome]
scenarios:
  - name: draw
    steps: {}
"##,
            DEFAULT_READY_SCRIPT, extra_steps
        );
        SuiteSpec::from_yaml(&yaml).unwrap()
    }

    fn runner(factory: SimulatedFactory, root: &Path) -> Runner {
        let mut config = HarnessConfig::default();
        config.artifacts.baseline_root = root.to_path_buf();
        Runner::new(config, Arc::new(factory))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_records_then_passes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SimulatedFactory::new(PageModel::default());
        let runner = runner(factory, dir.path());

        let first = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(first.recorded, 2);

        let second = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(second.passed, 2);
        assert!(second.success());
        assert_eq!(
            second.cases[0].states,
            vec![
                CaseState::Pending,
                CaseState::Loading,
                CaseState::Capturing,
                CaseState::Comparing,
                CaseState::Passed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_engine_errors_without_stopping_others() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SimulatedFactory::new(PageModel::default().with_unavailable(Engine::Firefox));
        let probe = factory.probe();
        let runner = runner(factory, dir.path());

        let summary = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.cases[0].engine, Engine::Firefox);
        assert!(summary.cases[0].error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(probe.sessions_opened(), probe.sessions_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_errors_and_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SimulatedFactory::new(PageModel::default().never_ready());
        let probe = factory.probe();
        let runner = runner(factory, dir.path());

        let summary = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(summary.errored, 2);
        assert_eq!(probe.sessions_opened(), 2);
        assert_eq!(probe.sessions_closed(), 2);
        // Nothing was captured
        assert!(summary.cases.iter().all(|c| c.actual_path.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_suite_closes_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SimulatedFactory::new(PageModel::default().never_ready());
        let probe = factory.probe();
        let cancel = CancellationToken::new();
        let runner = runner(factory, dir.path()).with_cancellation(cancel.clone());
        assert!(!runner.cancellation_token().is_cancelled());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        let summary = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(summary.errored, 2);
        assert!(summary
            .cases
            .iter()
            .all(|c| c.error.as_deref() == Some("Cancelled")));
        assert_eq!(probe.sessions_opened(), probe.sessions_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_baseline_without_recording_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.artifacts.baseline_root = dir.path().to_path_buf();
        config.runner.record_missing = false;
        let runner = Runner::new(config, Arc::new(SimulatedFactory::new(PageModel::default())));

        let summary = runner.run_suite(&suite("[]")).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert!(summary.cases[0].error.as_deref().unwrap().contains("no baseline"));
        assert!(runner.store().list_revisions(&summary.cases[0].case).await.unwrap().is_empty());
    }

    #[test]
    fn test_write_summary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(SimulatedFactory::new(PageModel::default()), dir.path());
        let summary = SuiteSummary::from_reports("empty", Utc::now(), Duration::from_millis(5), vec![]);

        let path = runner
            .write_summary(&summary, &dir.path().join("out").join("summary.json"))
            .unwrap();
        let parsed: SuiteSummary =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed.suite, "empty");
        assert!(parsed.success());
    }
}
