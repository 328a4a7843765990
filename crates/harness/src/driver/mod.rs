//! Browser driver abstraction
//!
//! Every engine is reached through the same two traits: a [`SessionFactory`]
//! that opens a [`BrowserSession`] bound to a viewport, and the session itself
//! exposing navigation, resizing, script evaluation, pointer control and
//! screenshots. Concrete variants are selected by configuration:
//!
//! - [`webdriver::WebDriverFactory`] talks W3C WebDriver to geckodriver or
//!   chromedriver.
//! - [`simulated::SimulatedFactory`] renders a deterministic tile map in
//!   process, for tests and dry runs.

pub mod service;
pub mod simulated;
pub mod webdriver;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::case::{CaseId, Viewport};
use crate::error::{HarnessError, HarnessResult};
use crate::interaction::{self, InteractionIntent};
use crate::screenshot::Screenshot;

/// Browser engines a suite can be parameterized over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Firefox,
    Chrome,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Firefox => "firefox",
            Engine::Chrome => "chrome",
        }
    }

    /// WebDriver binary used when none is configured
    pub fn default_driver_binary(&self) -> &'static str {
        match self {
            Engine::Firefox => "geckodriver",
            Engine::Chrome => "chromedriver",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firefox" => Ok(Engine::Firefox),
            "chrome" | "chromium" => Ok(Engine::Chrome),
            other => Err(HarnessError::Config(format!("unknown engine: {}", other))),
        }
    }
}

/// Point in viewport coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Element bounding box in viewport coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point::new(
            (self.x + self.width / 2.0).floor() as i64,
            (self.y + self.height / 2.0).floor() as i64,
        )
    }
}

/// Primitive pointer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointerAction {
    /// Move to an absolute viewport position
    Move { x: i64, y: i64 },
    /// Press the primary button
    Down,
    /// Release the primary button
    Up,
}

/// A live browser instance owned by exactly one case
#[async_trait]
pub trait BrowserSession: Send {
    fn engine(&self) -> Engine;

    /// Current viewport size
    fn viewport(&self) -> Viewport;

    async fn navigate(&mut self, url: &str) -> HarnessResult<()>;

    async fn resize(&mut self, viewport: Viewport) -> HarnessResult<()>;

    /// Evaluate a script body in the page and return its JSON result
    async fn execute_script(&mut self, script: &str) -> HarnessResult<serde_json::Value>;

    /// Bounding box of the first element matching `selector`
    async fn element_rect(&mut self, selector: &str) -> HarnessResult<Option<Rect>>;

    /// Dispatch a pointer sequence as one uninterrupted gesture
    async fn dispatch_pointer(&mut self, actions: &[PointerAction]) -> HarnessResult<()>;

    /// PNG bytes of the visible viewport
    async fn screenshot_png(&mut self) -> HarnessResult<Vec<u8>>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&mut self) -> HarnessResult<()>;

    /// Drag the element matching `selector` by `(dx, dy)`
    async fn drag(&mut self, selector: &str, dx: i64, dy: i64) -> HarnessResult<()> {
        interaction::perform(self, &InteractionIntent::drag(selector, dx, dy)).await
    }
}

/// Opens sessions for one or more engines
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        engine: Engine,
        viewport: Viewport,
    ) -> HarnessResult<Box<dyn BrowserSession>>;
}

/// Capture the viewport as a decoded [`Screenshot`] tagged with its case
pub async fn capture<S>(session: &mut S, case: &CaseId) -> HarnessResult<Screenshot>
where
    S: BrowserSession + ?Sized,
{
    let png = session.screenshot_png().await?;
    Screenshot::from_png(case.clone(), &png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_parse_and_display() {
        assert_eq!("Firefox".parse::<Engine>().unwrap(), Engine::Firefox);
        assert_eq!("chromium".parse::<Engine>().unwrap(), Engine::Chrome);
        assert!("webkit".parse::<Engine>().is_err());
        assert_eq!(Engine::Chrome.to_string(), "chrome");
    }

    #[test]
    fn test_rect_center() {
        let rect = Rect {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 480.0,
        };
        assert_eq!(rect.center(), Point::new(320, 240));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_and_capture_through_trait_object() {
        use std::time::Duration;

        let factory = simulated::SimulatedFactory::new(simulated::PageModel::default());
        let probe = factory.probe();
        let mut session = factory
            .open(Engine::Firefox, Viewport::new(64, 48))
            .await
            .unwrap();
        session.navigate("http://sim/osmLayer/index.html").await.unwrap();

        session.drag("#map", 8, 4).await.unwrap();
        assert_eq!(probe.pointer_events().len(), 13);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let case = CaseId::new(["osmLayer", "pan", "firefox"]).unwrap();
        let shot = capture(session.as_mut(), &case).await.unwrap();
        assert_eq!(shot.dimensions(), (64, 48));
        assert_eq!(shot.case, case);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(probe.sessions_closed(), 1);
        assert!(session.screenshot_png().await.is_err());
    }
}
