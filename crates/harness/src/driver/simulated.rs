//! In-process simulated browser
//!
//! Renders a deterministic tile map that pans under pointer drags and whose
//! tiles "load" a fixed time after every navigation or pan. Until they have
//! loaded, tiles are drawn as grey placeholders and the readiness script
//! returns `false`, which is exactly the situation the harness has to
//! synchronize against in a real browser.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::case::Viewport;
use crate::driver::{BrowserSession, Engine, PointerAction, Rect, SessionFactory};
use crate::error::{HarnessError, HarnessResult};
use crate::screenshot::encode_png;

const PLACEHOLDER: Rgba<u8> = Rgba([200, 200, 200, 255]);

/// Readiness predicate the osmLayer page exposes once its tiles have loaded
pub const DEFAULT_READY_SCRIPT: &str = "return window.testComplete === true;";

/// Behaviour of the simulated page
#[derive(Debug, Clone)]
pub struct PageModel {
    ready_script: String,
    /// Selector of the pannable map element
    map_selector: String,
    /// Extra elements and their boxes
    elements: HashMap<String, Rect>,
    /// Time for tiles to load after navigation or a pan; `None` never loads
    load_delay: Option<Duration>,
    tile_size: u32,
    /// Varies tile colours; a different seed renders a different map
    seed: u64,
    /// Engines that fail to start
    unavailable: HashSet<Engine>,
}

impl Default for PageModel {
    fn default() -> Self {
        Self {
            ready_script: DEFAULT_READY_SCRIPT.to_string(),
            map_selector: "#map".to_string(),
            elements: HashMap::new(),
            load_delay: Some(Duration::from_millis(200)),
            tile_size: 32,
            seed: 0x5eed,
            unavailable: HashSet::new(),
        }
    }
}

impl PageModel {
    pub fn ready_script(&self) -> &str {
        &self.ready_script
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Tiles never finish loading
    pub fn never_ready(mut self) -> Self {
        self.load_delay = None;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_element(mut self, selector: impl Into<String>, rect: Rect) -> Self {
        self.elements.insert(selector.into(), rect);
        self
    }

    pub fn with_unavailable(mut self, engine: Engine) -> Self {
        self.unavailable.insert(engine);
        self
    }

    fn tile_color(&self, tx: i64, ty: i64) -> Rgba<u8> {
        // splitmix-style mixing, stable across runs and platforms
        let mut h = self.seed
            ^ (tx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (ty as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        h ^= h >> 31;
        h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h ^= h >> 29;
        Rgba([
            64 + (h & 0x7f) as u8,
            96 + ((h >> 8) & 0x7f) as u8,
            32 + ((h >> 16) & 0x7f) as u8,
            255,
        ])
    }
}

/// Everything observable about the simulated sessions a factory handed out
#[derive(Debug, Default)]
pub struct SimulationProbe {
    inner: Mutex<ProbeState>,
}

#[derive(Debug, Default)]
struct ProbeState {
    opened: usize,
    closed: usize,
    navigations: Vec<String>,
    pointer_events: Vec<(Engine, PointerAction)>,
}

impl SimulationProbe {
    pub fn sessions_opened(&self) -> usize {
        self.inner.lock().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.lock().closed
    }

    pub fn navigations(&self) -> Vec<String> {
        self.inner.lock().navigations.clone()
    }

    pub fn pointer_events(&self) -> Vec<(Engine, PointerAction)> {
        self.inner.lock().pointer_events.clone()
    }
}

/// Opens simulated sessions sharing one page model
#[derive(Debug, Clone)]
pub struct SimulatedFactory {
    model: Arc<PageModel>,
    probe: Arc<SimulationProbe>,
}

impl SimulatedFactory {
    pub fn new(model: PageModel) -> Self {
        Self {
            model: Arc::new(model),
            probe: Arc::new(SimulationProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<SimulationProbe> {
        self.probe.clone()
    }
}

#[async_trait]
impl SessionFactory for SimulatedFactory {
    async fn open(
        &self,
        engine: Engine,
        viewport: Viewport,
    ) -> HarnessResult<Box<dyn BrowserSession>> {
        if self.model.unavailable.contains(&engine) {
            return Err(HarnessError::SessionUnavailable {
                engine: engine.to_string(),
                reason: "simulated engine refused to start".to_string(),
            });
        }

        self.probe.inner.lock().opened += 1;
        debug!("Opened simulated {} session at {}", engine, viewport);

        Ok(Box::new(SimulatedSession {
            engine,
            viewport,
            model: self.model.clone(),
            probe: self.probe.clone(),
            url: None,
            pan: (0, 0),
            tiles_ready_at: None,
            pointer: PointerState::default(),
            closed: false,
        }))
    }
}

#[derive(Debug, Default)]
struct PointerState {
    position: (i64, i64),
    pressed: bool,
    dragging_map: bool,
}

/// One simulated browser tab
pub struct SimulatedSession {
    engine: Engine,
    viewport: Viewport,
    model: Arc<PageModel>,
    probe: Arc<SimulationProbe>,
    url: Option<String>,
    pan: (i64, i64),
    tiles_ready_at: Option<Instant>,
    pointer: PointerState,
    closed: bool,
}

impl SimulatedSession {
    fn ensure_open(&self) -> HarnessResult<()> {
        if self.closed {
            return Err(HarnessError::SessionUnavailable {
                engine: self.engine.to_string(),
                reason: "session already closed".to_string(),
            });
        }
        Ok(())
    }

    fn map_rect(&self) -> Rect {
        Rect {
            x: 0.0,
            y: 0.0,
            width: f64::from(self.viewport.width),
            height: f64::from(self.viewport.height),
        }
    }

    fn start_tile_load(&mut self) {
        self.tiles_ready_at = self.model.load_delay.map(|d| Instant::now() + d);
    }

    fn tiles_ready(&self) -> bool {
        self.url.is_some()
            && self
                .tiles_ready_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false)
    }

    fn render(&self) -> RgbaImage {
        let Viewport { width, height } = self.viewport;
        if !self.tiles_ready() {
            return RgbaImage::from_pixel(width, height, PLACEHOLDER);
        }

        let size = i64::from(self.model.tile_size);
        RgbaImage::from_fn(width, height, |x, y| {
            let mx = i64::from(x) - self.pan.0;
            let my = i64::from(y) - self.pan.1;
            let (tx, ty) = (mx.div_euclid(size), my.div_euclid(size));
            if mx.rem_euclid(size) == 0 || my.rem_euclid(size) == 0 {
                Rgba([40, 40, 40, 255])
            } else {
                self.model.tile_color(tx, ty)
            }
        })
    }

    fn apply_pointer(&mut self, action: PointerAction) {
        match action {
            PointerAction::Move { x, y } => {
                if self.pointer.pressed && self.pointer.dragging_map {
                    self.pan.0 += x - self.pointer.position.0;
                    self.pan.1 += y - self.pointer.position.1;
                }
                self.pointer.position = (x, y);
            }
            PointerAction::Down => {
                let (x, y) = self.pointer.position;
                let rect = self.map_rect();
                self.pointer.pressed = true;
                self.pointer.dragging_map = (x as f64) >= rect.x
                    && (y as f64) >= rect.y
                    && (x as f64) < rect.x + rect.width
                    && (y as f64) < rect.y + rect.height;
            }
            PointerAction::Up => {
                self.pointer.pressed = false;
                self.pointer.dragging_map = false;
            }
        }
    }
}

#[async_trait]
impl BrowserSession for SimulatedSession {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn navigate(&mut self, url: &str) -> HarnessResult<()> {
        self.ensure_open()?;
        self.url = Some(url.to_string());
        self.pan = (0, 0);
        self.start_tile_load();
        self.probe.inner.lock().navigations.push(url.to_string());
        Ok(())
    }

    async fn resize(&mut self, viewport: Viewport) -> HarnessResult<()> {
        self.ensure_open()?;
        self.viewport = viewport;
        Ok(())
    }

    async fn execute_script(&mut self, script: &str) -> HarnessResult<Value> {
        self.ensure_open()?;
        if script == self.model.ready_script {
            return Ok(Value::Bool(self.tiles_ready()));
        }
        if script.contains("innerWidth") {
            return Ok(json!([self.viewport.width, self.viewport.height]));
        }
        Ok(Value::Null)
    }

    async fn element_rect(&mut self, selector: &str) -> HarnessResult<Option<Rect>> {
        self.ensure_open()?;
        if self.url.is_none() {
            return Ok(None);
        }
        if selector == self.model.map_selector {
            return Ok(Some(self.map_rect()));
        }
        Ok(self.model.elements.get(selector).copied())
    }

    async fn dispatch_pointer(&mut self, actions: &[PointerAction]) -> HarnessResult<()> {
        self.ensure_open()?;
        let pan_before = self.pan;
        {
            let mut probe = self.probe.inner.lock();
            probe
                .pointer_events
                .extend(actions.iter().map(|a| (self.engine, *a)));
        }
        for action in actions {
            self.apply_pointer(*action);
        }
        if self.pan != pan_before {
            self.start_tile_load();
        }
        Ok(())
    }

    async fn screenshot_png(&mut self) -> HarnessResult<Vec<u8>> {
        self.ensure_open()?;
        encode_png(&self.render())
    }

    async fn close(&mut self) -> HarnessResult<()> {
        if !self.closed {
            self.closed = true;
            self.probe.inner.lock().closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{perform, InteractionIntent};

    async fn session(model: PageModel) -> (Box<dyn BrowserSession>, Arc<SimulationProbe>) {
        let factory = SimulatedFactory::new(model);
        let probe = factory.probe();
        let mut s = factory
            .open(Engine::Chrome, Viewport::new(64, 48))
            .await
            .unwrap();
        s.navigate("http://sim/osmLayer/index.html").await.unwrap();
        (s, probe)
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_until_tiles_load() {
        let (mut s, _) = session(PageModel::default()).await;
        let early = image::load_from_memory(&s.screenshot_png().await.unwrap())
            .unwrap()
            .to_rgba8();
        assert!(early.pixels().all(|p| *p == PLACEHOLDER));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let late = image::load_from_memory(&s.screenshot_png().await.unwrap())
            .unwrap()
            .to_rgba8();
        assert!(late.pixels().any(|p| *p != PLACEHOLDER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_pans_and_reloads_tiles() {
        let (mut s, probe) = session(PageModel::default()).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let before = s.screenshot_png().await.unwrap();

        perform(s.as_mut(), &InteractionIntent::drag("#map", 10, 5))
            .await
            .unwrap();
        assert_eq!(
            s.execute_script(DEFAULT_READY_SCRIPT).await.unwrap(),
            Value::Bool(false)
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        let after = s.screenshot_png().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(probe.pointer_events().len(), 13);
    }

    #[tokio::test]
    async fn test_unavailable_engine() {
        let factory = SimulatedFactory::new(PageModel::default().with_unavailable(Engine::Firefox));
        let err = factory
            .open(Engine::Firefox, Viewport::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::SessionUnavailable { .. }));
        assert_eq!(factory.probe().sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut s, probe) = session(PageModel::default()).await;
        s.close().await.unwrap();
        s.close().await.unwrap();
        assert_eq!(probe.sessions_closed(), 1);
        assert!(s.screenshot_png().await.is_err());
    }
}
