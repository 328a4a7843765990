//! mapshot screenshot regression harness
//!
//! This crate drives interactive map pages in several browser engines and
//! compares what they render against revisioned baseline images:
//! - Opens one fresh browser session per case (WebDriver or simulated)
//! - Waits for asynchronous tile loading to settle before capturing
//! - Simulates pointer drags with interpolated moves
//! - Stores baselines keyed by case identity and revision
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runner                               │
//! │    ├── run_suite(SuiteSpec) -> SuiteSummary                  │
//! │    └── run_case(CaseDefinition) -> CaseReport                │
//! │          open ─ navigate ─ wait ─ (drag ─ wait) ─ capture    │
//! │                                      │                       │
//! │                  BaselineStore ── Comparator                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SessionFactory / BrowserSession                            │
//! │    ├── WebDriverFactory (geckodriver, chromedriver)         │
//! │    └── SimulatedFactory (in-process tile map)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteSpec (YAML)                                           │
//! │    ├── name, tags, url, viewport, ready_script              │
//! │    ├── engines: [firefox, chrome]                           │
//! │    └── scenarios: [{ name, revision, steps }]               │
//! │          ├── drag { selector, dx, dy }                      │
//! │          └── wait { script | settle_ms }                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod baseline;
pub mod case;
pub mod compare;
pub mod config;
pub mod driver;
pub mod error;
pub mod interaction;
pub mod logging;
pub mod readiness;
pub mod registry;
pub mod runner;
pub mod screenshot;

pub use baseline::{BaselineEntry, BaselineStore, PutOutcome};
pub use case::{CaseId, Viewport};
pub use compare::{Comparator, ComparisonResult, Verdict};
pub use config::HarnessConfig;
pub use driver::{BrowserSession, Engine, SessionFactory};
pub use error::{HarnessError, HarnessResult};
pub use registry::{CaseDefinition, ScenarioStep, SuiteSpec};
pub use runner::{CaseOutcome, CaseReport, Runner, SuiteSummary};
