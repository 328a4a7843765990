//! Pointer interaction simulation
//!
//! Declarative intents are turned into primitive pointer sequences. A drag
//! emits intermediate moves rather than a single jump: browsers only start
//! drag handling after they have seen movement while the button is held.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::case::Viewport;
use crate::driver::{BrowserSession, Point, PointerAction};
use crate::error::{HarnessError, HarnessResult};

/// Default number of interpolated moves between press and release
pub const DEFAULT_DRAG_STEPS: u32 = 10;

/// What the user does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionKind {
    /// Press on the element centre, move by the offset, release
    Drag { dx: i64, dy: i64 },
}

/// A single user action against one element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionIntent {
    pub selector: String,
    #[serde(flatten)]
    pub kind: InteractionKind,
    /// Interpolated moves for gestures with a path
    pub steps: u32,
}

impl InteractionIntent {
    pub fn drag(selector: impl Into<String>, dx: i64, dy: i64) -> Self {
        Self {
            selector: selector.into(),
            kind: InteractionKind::Drag { dx, dy },
            steps: DEFAULT_DRAG_STEPS,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(2);
        self
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            InteractionKind::Drag { dx, dy } => {
                format!("drag {} by ({}, {})", self.selector, dx, dy)
            }
        }
    }
}

/// Carry out an intent through the session's pointer capability.
///
/// Nothing is dispatched unless the whole gesture is valid: a missing element
/// or a path leaving the viewport fails before any pointer event is sent.
pub async fn perform<S>(session: &mut S, intent: &InteractionIntent) -> HarnessResult<()>
where
    S: BrowserSession + ?Sized,
{
    match &intent.kind {
        InteractionKind::Drag { dx, dy } => {
            let rect = session
                .element_rect(&intent.selector)
                .await?
                .ok_or_else(|| HarnessError::ElementNotFound(intent.selector.clone()))?;

            let start = rect.center();
            let end = Point::new(start.x + dx, start.y + dy);
            let actions = drag_path(start, end, intent.steps, session.viewport())?;

            debug!(
                "{} from ({}, {}) in {} pointer events",
                intent.describe(),
                start.x,
                start.y,
                actions.len()
            );
            session.dispatch_pointer(&actions).await
        }
    }
}

/// Pointer sequence for a drag from `start` to `end`:
/// move to start, press, `steps` interpolated moves ending on `end`, release.
pub fn drag_path(
    start: Point,
    end: Point,
    steps: u32,
    viewport: Viewport,
) -> HarnessResult<Vec<PointerAction>> {
    // The segment is straight, so checking both ends covers every sample.
    for p in [start, end] {
        if !viewport.contains(p.x, p.y) {
            return Err(HarnessError::OutOfViewport {
                x: p.x,
                y: p.y,
                width: viewport.width,
                height: viewport.height,
            });
        }
    }

    let steps = steps.max(2);
    let mut actions = Vec::with_capacity(steps as usize + 3);
    actions.push(PointerAction::Move {
        x: start.x,
        y: start.y,
    });
    actions.push(PointerAction::Down);

    let dx = (end.x - start.x) as f64;
    let dy = (end.y - start.y) as f64;
    for i in 1..=steps {
        let t = f64::from(i) / f64::from(steps);
        actions.push(PointerAction::Move {
            x: start.x + (dx * t).round() as i64,
            y: start.y + (dy * t).round() as i64,
        });
    }

    actions.push(PointerAction::Up);
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drag_path_shape() {
        let actions = drag_path(
            Point::new(320, 240),
            Point::new(520, 390),
            10,
            Viewport::new(640, 480),
        )
        .unwrap();

        assert_eq!(actions.len(), 13);
        assert_eq!(actions[0], PointerAction::Move { x: 320, y: 240 });
        assert_eq!(actions[1], PointerAction::Down);
        assert_eq!(actions[11], PointerAction::Move { x: 520, y: 390 });
        assert_eq!(actions[12], PointerAction::Up);
    }

    #[test]
    fn test_drag_path_moves_are_monotonic() {
        let actions = drag_path(
            Point::new(10, 10),
            Point::new(110, 60),
            4,
            Viewport::new(640, 480),
        )
        .unwrap();

        let xs: Vec<i64> = actions
            .iter()
            .filter_map(|a| match a {
                PointerAction::Move { x, .. } => Some(*x),
                _ => None,
            })
            .collect();
        assert_eq!(xs, vec![10, 35, 60, 85, 110]);
    }

    #[test]
    fn test_drag_leaving_viewport_rejected() {
        let err = drag_path(
            Point::new(320, 240),
            Point::new(700, 240),
            10,
            Viewport::new(640, 480),
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::OutOfViewport { x: 700, .. }));
    }

    #[test]
    fn test_steps_floor() {
        let intent = InteractionIntent::drag("#map", 1, 1).with_steps(0);
        assert_eq!(intent.steps, 2);
    }
}
