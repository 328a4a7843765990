//! Case identity and viewport value types

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Ordered tag sequence identifying one parameterized case,
/// e.g. `["osmLayer", "pan", "chrome"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(Vec<String>);

impl CaseId {
    pub fn new<I, S>(tags: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Err(HarnessError::SuiteParse(
                "case identity needs at least one tag".to_string(),
            ));
        }
        if let Some(blank) = tags.iter().find(|t| t.trim().is_empty()) {
            return Err(HarnessError::SuiteParse(format!(
                "case identity contains a blank tag: {:?}",
                blank
            )));
        }
        Ok(Self(tags))
    }

    pub fn tags(&self) -> &[String] {
        &self.0
    }

    /// Human-readable label, tags joined by `/`
    pub fn label(&self) -> String {
        self.0.join("/")
    }

    /// Relative directory for this case inside an artifact root.
    ///
    /// Every tag becomes one path component. Bytes outside `[A-Za-z0-9._-]`
    /// are percent-encoded, so distinct identities never share a directory
    /// and a tag can never escape the root.
    pub fn relative_dir(&self) -> PathBuf {
        self.0.iter().map(|tag| encode_component(tag)).collect()
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn encode_component(tag: &str) -> String {
    // "." and ".." would walk the tree
    let all_dots = tag.bytes().all(|b| b == b'.');

    let mut encoded = String::with_capacity(tag.len());
    for b in tag.bytes() {
        let safe = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && !all_dots);
        if safe {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{:02X}", b));
        }
    }
    encoded
}

/// Browser viewport in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether a point lies inside the visible area
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_label_joins_tags_in_order() {
        let id = CaseId::new(["osmLayer", "pan", "chrome"]).unwrap();
        assert_eq!(id.label(), "osmLayer/pan/chrome");
        assert_eq!(id.tags().len(), 3);
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(CaseId::new(Vec::<String>::new()).is_err());
        assert!(CaseId::new(["osmLayer", " "]).is_err());
    }

    fn components(id: &CaseId) -> Vec<String> {
        id.relative_dir()
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_relative_dir_cannot_escape_root() {
        let id = CaseId::new(["..", "a/b", "firefox"]).unwrap();
        assert_eq!(components(&id), vec!["%2E%2E", "a%2Fb", "firefox"]);
    }

    #[test_case(&["osm/Layer", "draw", "firefox"], &["osm_Layer", "draw", "firefox"] ; "slash and underscore")]
    #[test_case(&["osm Layer", "draw", "firefox"], &["osm%20Layer", "draw", "firefox"] ; "space and literal escape")]
    #[test_case(&["..", "draw", "firefox"], &["%2E%2E", "draw", "firefox"] ; "dots and literal escape")]
    #[test_case(&["osmLayer", "pan", "chrome"], &["osmLayer", "pan", "chrome", "1"] ; "extra tag")]
    fn test_distinct_identities_get_distinct_dirs(a: &[&str], b: &[&str]) {
        let a = CaseId::new(a.iter().copied()).unwrap();
        let b = CaseId::new(b.iter().copied()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.relative_dir(), b.relative_dir());
    }

    #[test]
    fn test_plain_tags_are_kept_verbatim() {
        let id = CaseId::new(["osmLayer", "pan.v2", "chrome"]).unwrap();
        assert_eq!(components(&id), vec!["osmLayer", "pan.v2", "chrome"]);
    }

    #[test]
    fn test_viewport_contains() {
        let vp = Viewport::new(640, 480);
        assert!(vp.contains(0, 0));
        assert!(vp.contains(639, 479));
        assert!(!vp.contains(640, 10));
        assert!(!vp.contains(-1, 10));
    }
}
