//! Screenshot comparison against baselines

use std::path::{Path, PathBuf};

use image::{Pixel, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::screenshot::{encode_png, Screenshot};

/// Outcome of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    NoBaseline,
}

/// Result of a comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub verdict: Verdict,

    /// Fraction of pixels that differ (0.0 - 1.0)
    pub difference_ratio: f64,

    /// Number of differing pixels
    pub differing_pixels: u64,

    /// Total pixels compared
    pub total_pixels: u64,

    /// Diff image, written only on failure
    pub diff_artifact: Option<PathBuf>,

    /// Human-readable explanation for non-pixel failures
    pub detail: Option<String>,
}

impl ComparisonResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    fn no_baseline() -> Self {
        Self {
            verdict: Verdict::NoBaseline,
            difference_ratio: 0.0,
            differing_pixels: 0,
            total_pixels: 0,
            diff_artifact: None,
            detail: None,
        }
    }
}

/// Pixel-level difference between two equally sized images
#[derive(Debug, Clone)]
pub struct PixelDiff {
    pub differing_pixels: u64,
    pub total_pixels: u64,

    /// Differing pixels in red, everything else dimmed
    pub image: RgbaImage,
}

impl PixelDiff {
    pub fn ratio(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        self.differing_pixels as f64 / self.total_pixels as f64
    }
}

/// Whether any channel of `a` and `b` differs by more than `threshold`
pub fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>, threshold: u8) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| x.abs_diff(*y) > threshold)
}

/// Per-pixel diff of `actual` against `baseline`
pub fn diff_images(
    actual: &RgbaImage,
    baseline: &RgbaImage,
    pixel_threshold: u8,
) -> HarnessResult<PixelDiff> {
    if actual.dimensions() != baseline.dimensions() {
        return Err(HarnessError::DimensionMismatch {
            captured: actual.dimensions(),
            baseline: baseline.dimensions(),
        });
    }

    let (width, height) = actual.dimensions();
    let mut image = RgbaImage::new(width, height);
    let mut differing_pixels = 0u64;

    for (x, y, actual_pixel) in actual.enumerate_pixels() {
        let baseline_pixel = baseline.get_pixel(x, y);
        if pixels_differ(actual_pixel, baseline_pixel, pixel_threshold) {
            differing_pixels += 1;
            image.put_pixel(x, y, Rgba([255, 0, 0, 255]));
        } else {
            let c = actual_pixel.channels();
            image.put_pixel(x, y, Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128]));
        }
    }

    Ok(PixelDiff {
        differing_pixels,
        total_pixels: u64::from(width) * u64::from(height),
        image,
    })
}

/// Decides pass/fail for captures
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    pixel_threshold: u8,
}

impl Default for Comparator {
    fn default() -> Self {
        Self { pixel_threshold: 5 }
    }
}

impl Comparator {
    pub fn new(pixel_threshold: u8) -> Self {
        Self { pixel_threshold }
    }

    /// Compare `captured` against `baseline`.
    ///
    /// `tolerance` is the allowed fraction of differing pixels. The diff image
    /// is written to `diff_path` only when the verdict is `Fail` and the
    /// dimensions agree.
    pub async fn compare(
        &self,
        captured: &Screenshot,
        baseline: Option<&RgbaImage>,
        tolerance: f64,
        diff_path: &Path,
    ) -> HarnessResult<ComparisonResult> {
        let Some(baseline) = baseline else {
            debug!("No baseline for {}", captured.case);
            return Ok(ComparisonResult::no_baseline());
        };

        let diff = match diff_images(&captured.image, baseline, self.pixel_threshold) {
            Ok(diff) => diff,
            Err(HarnessError::DimensionMismatch { captured: c, baseline: b }) => {
                warn!(
                    "Screenshot dimensions differ for {}: captured {:?} vs baseline {:?}",
                    captured.case, c, b
                );
                return Ok(ComparisonResult {
                    verdict: Verdict::Fail,
                    difference_ratio: 1.0,
                    differing_pixels: 0,
                    total_pixels: u64::from(c.0) * u64::from(c.1),
                    diff_artifact: None,
                    detail: Some(format!(
                        "dimension mismatch: captured {}x{}, baseline {}x{}",
                        c.0, c.1, b.0, b.1
                    )),
                });
            }
            Err(e) => return Err(e),
        };

        let ratio = diff.ratio();
        if ratio <= tolerance {
            return Ok(ComparisonResult {
                verdict: Verdict::Pass,
                difference_ratio: ratio,
                differing_pixels: diff.differing_pixels,
                total_pixels: diff.total_pixels,
                diff_artifact: None,
                detail: None,
            });
        }

        warn!(
            "Visual regression detected in {}: {:.4} of pixels differ (tolerance: {:.4})",
            captured.case, ratio, tolerance
        );

        let png = encode_png(&diff.image)?;
        if let Some(parent) = diff_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(diff_path, png).await?;

        Ok(ComparisonResult {
            verdict: Verdict::Fail,
            difference_ratio: ratio,
            differing_pixels: diff.differing_pixels,
            total_pixels: diff.total_pixels,
            diff_artifact: Some(diff_path.to_path_buf()),
            detail: None,
        })
    }
}
