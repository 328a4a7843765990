//! W3C WebDriver backend
//!
//! Firefox and Chrome differ only in the driver binary they need and the
//! capabilities sent when the session is created; everything after that goes
//! through the same `thirtyfour` client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thirtyfour::error::WebDriverErrorInner;
use thirtyfour::prelude::*;
use thirtyfour::Capabilities;
use tracing::{debug, info, warn};

use crate::case::Viewport;
use crate::config::{EngineConfig, HarnessConfig};
use crate::driver::service::DriverService;
use crate::driver::{BrowserSession, Engine, PointerAction, Rect, SessionFactory};
use crate::error::{HarnessError, HarnessResult};

const INNER_SIZE_SCRIPT: &str = "return [window.innerWidth, window.innerHeight];";

/// Opens real browser sessions through WebDriver
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    config: HarnessConfig,
}

impl WebDriverFactory {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

/// Capabilities for a new session of `engine`
pub fn capabilities(engine: Engine, config: &EngineConfig) -> Capabilities {
    let mut args: Vec<String> = Vec::new();
    let caps = match engine {
        Engine::Firefox => {
            if config.headless {
                args.push("-headless".to_string());
            }
            args.extend(config.args.iter().cloned());
            json!({
                "browserName": "firefox",
                "moz:firefoxOptions": {
                    "args": args,
                    "prefs": { "layout.css.devPixelsPerPx": "1.0" }
                }
            })
        }
        Engine::Chrome => {
            if config.headless {
                args.push("--headless=new".to_string());
            }
            args.push("--hide-scrollbars".to_string());
            args.push("--force-device-scale-factor=1".to_string());
            args.extend(config.args.iter().cloned());
            json!({
                "browserName": "chrome",
                "goog:chromeOptions": { "args": args }
            })
        }
    };

    match caps {
        Value::Object(map) => map,
        _ => Capabilities::new(),
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn open(
        &self,
        engine: Engine,
        viewport: Viewport,
    ) -> HarnessResult<Box<dyn BrowserSession>> {
        let engine_config = self.config.engine(engine);

        let (service, endpoint) = match &engine_config.remote_url {
            Some(url) => (None, url.clone()),
            None => {
                let service = DriverService::spawn(engine, &engine_config).await?;
                let url = service.url().to_string();
                (Some(service), url)
            }
        };

        let driver = WebDriver::new(&endpoint, capabilities(engine, &engine_config))
            .await
            .map_err(|e| HarnessError::SessionUnavailable {
                engine: engine.to_string(),
                reason: e.to_string(),
            })?;

        info!("Opened {} session via {}", engine, endpoint);

        let mut session = WebDriverSession {
            engine,
            viewport,
            navigation_timeout: engine_config.navigation_timeout(),
            driver: Some(driver),
            service,
        };

        if let Err(e) = session.prepare(viewport).await {
            let _ = session.close().await;
            return Err(e);
        }

        Ok(Box::new(session))
    }
}

/// One live WebDriver session plus, when spawned locally, its driver process
pub struct WebDriverSession {
    engine: Engine,
    viewport: Viewport,
    navigation_timeout: Duration,
    driver: Option<WebDriver>,
    service: Option<DriverService>,
}

impl WebDriverSession {
    fn driver(&self) -> HarnessResult<&WebDriver> {
        self.driver
            .as_ref()
            .ok_or_else(|| HarnessError::SessionUnavailable {
                engine: self.engine.to_string(),
                reason: "session already closed".to_string(),
            })
    }

    async fn prepare(&mut self, viewport: Viewport) -> HarnessResult<()> {
        self.driver()?
            .set_page_load_timeout(self.navigation_timeout)
            .await?;
        self.resize(viewport).await
    }

    async fn inner_size(&self) -> HarnessResult<(i64, i64)> {
        let value: Value = self
            .driver()?
            .execute(INNER_SIZE_SCRIPT, Vec::new())
            .await?
            .convert()?;
        let w = value.get(0).and_then(Value::as_i64).unwrap_or_default();
        let h = value.get(1).and_then(Value::as_i64).unwrap_or_default();
        Ok((w, h))
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn navigate(&mut self, url: &str) -> HarnessResult<()> {
        debug!("Navigating {} to {}", self.engine, url);
        let timeout = self.navigation_timeout;
        let driver = self.driver()?;

        match tokio::time::timeout(timeout + Duration::from_secs(1), driver.goto(url)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_timeout(&e) => {
                Err(HarnessError::NavigationTimeout {
                    url: url.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarnessError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }

    async fn resize(&mut self, viewport: Viewport) -> HarnessResult<()> {
        let driver = self.driver()?;
        driver
            .set_window_rect(0, 0, viewport.width, viewport.height)
            .await?;

        // The window rect includes browser chrome; grow it by the difference
        // so the page itself gets the requested size.
        let (inner_w, inner_h) = self.inner_size().await?;
        let extra_w = i64::from(viewport.width) - inner_w;
        let extra_h = i64::from(viewport.height) - inner_h;
        if inner_w > 0 && (extra_w != 0 || extra_h != 0) {
            let width = (i64::from(viewport.width) + extra_w).max(1) as u32;
            let height = (i64::from(viewport.height) + extra_h).max(1) as u32;
            self.driver()?.set_window_rect(0, 0, width, height).await?;
        }

        self.viewport = viewport;
        Ok(())
    }

    async fn execute_script(&mut self, script: &str) -> HarnessResult<Value> {
        let value: Value = self.driver()?.execute(script, Vec::new()).await?.convert()?;
        Ok(value)
    }

    async fn element_rect(&mut self, selector: &str) -> HarnessResult<Option<Rect>> {
        let elements = self.driver()?.find_all(By::Css(selector)).await?;
        let Some(element) = elements.first() else {
            return Ok(None);
        };
        let rect = element.rect().await?;
        Ok(Some(Rect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }))
    }

    async fn dispatch_pointer(&mut self, actions: &[PointerAction]) -> HarnessResult<()> {
        let mut chain = self.driver()?.action_chain();
        for action in actions {
            chain = match *action {
                PointerAction::Move { x, y } => chain.move_to(x, y),
                PointerAction::Down => chain.click_and_hold(),
                PointerAction::Up => chain.release(),
            };
        }
        chain.perform().await?;
        Ok(())
    }

    async fn screenshot_png(&mut self) -> HarnessResult<Vec<u8>> {
        Ok(self.driver()?.screenshot_as_png().await?)
    }

    async fn close(&mut self) -> HarnessResult<()> {
        let result = match self.driver.take() {
            Some(driver) => driver.quit().await.map_err(HarnessError::from),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!("Failed to quit {} session cleanly: {}", self.engine, e);
        }
        if let Some(mut service) = self.service.take() {
            service.stop().await;
        }
        result
    }
}

/// Page load and client-side timeouts, as opposed to other driver failures
fn is_timeout(err: &WebDriverError) -> bool {
    matches!(
        &**err,
        WebDriverErrorInner::Timeout(_) | WebDriverErrorInner::WebDriverTimeout(_)
    )
}
