//! Revision-keyed baseline store
//!
//! Baselines live under `<root>/<tag>/<tag>/.../<revision>.png`. Next to each
//! baseline the store keeps the last captured image (`<revision>.actual.png`)
//! and, after a failed comparison, the diff (`<revision>.diff.png`).
//!
//! Writes are atomic: data goes to a uniquely named temp file in the target
//! directory and is then hard-linked into place, which fails if the target
//! already exists. The first writer of a key wins; later writers either see
//! identical content or a conflict. Only a forced write replaces a baseline.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::case::CaseId;
use crate::error::{HarnessError, HarnessResult};
use crate::screenshot::{digest, encode_png};

/// A persisted reference image
#[derive(Debug, Clone)]
pub struct BaselineEntry {
    pub case: CaseId,
    pub revision: u32,
    pub path: PathBuf,

    /// SHA256 of the stored PNG
    pub digest: String,

    pub image: RgbaImage,
}

/// What a `put` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Created,
    Unchanged,
    Overwritten,
}

/// Filesystem baseline store
#[derive(Debug, Clone)]
pub struct BaselineStore {
    root: PathBuf,
    locks: Arc<DashMap<(CaseId, u32), Arc<Mutex<()>>>>,
}

impl BaselineStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every revision of `case`
    pub fn case_dir(&self, case: &CaseId) -> PathBuf {
        self.root.join(case.relative_dir())
    }

    pub fn baseline_path(&self, case: &CaseId, revision: u32) -> PathBuf {
        self.case_dir(case).join(format!("{}.png", revision))
    }

    pub fn diff_path(&self, case: &CaseId, revision: u32) -> PathBuf {
        self.case_dir(case).join(format!("{}.diff.png", revision))
    }

    pub fn actual_path(&self, case: &CaseId, revision: u32) -> PathBuf {
        self.case_dir(case).join(format!("{}.actual.png", revision))
    }

    /// Baseline for exactly `revision`
    pub async fn get(&self, case: &CaseId, revision: u32) -> HarnessResult<BaselineEntry> {
        let path = self.baseline_path(case, revision);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HarnessError::NoBaseline {
                    case: case.label(),
                    revision,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let image = image::load_from_memory(&bytes)?.to_rgba8();
        Ok(BaselineEntry {
            case: case.clone(),
            revision,
            digest: digest(&bytes),
            path,
            image,
        })
    }

    /// Store `image` as the baseline for (`case`, `revision`).
    ///
    /// Without `force`, an existing baseline with different pixels is a
    /// `BaselineWriteConflict` and is left untouched.
    pub async fn put(
        &self,
        case: &CaseId,
        revision: u32,
        image: &RgbaImage,
        force: bool,
    ) -> HarnessResult<PutOutcome> {
        let lock = self.lock_for(case, revision);
        let outcome = {
            let _guard = lock.lock().await;
            self.put_locked(case, revision, image, force).await
        };
        drop(lock);
        self.release_lock(case, revision);
        outcome
    }

    async fn put_locked(
        &self,
        case: &CaseId,
        revision: u32,
        image: &RgbaImage,
        force: bool,
    ) -> HarnessResult<PutOutcome> {
        let path = self.baseline_path(case, revision);
        let png = encode_png(image)?;

        if let Some(outcome) = self.resolve_existing(case, revision, &path, image, &png, force).await? {
            return Ok(outcome);
        }

        let tmp = self.write_temp(&path, &png).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                info!("Recorded baseline {} rev {} ({})", case, revision, digest(&png));
                Ok(PutOutcome::Created)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another process got there first
                debug!("Lost baseline race for {} rev {}", case, revision);
                match self.resolve_existing(case, revision, &path, image, &png, force).await? {
                    Some(outcome) => Ok(outcome),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle a `put` against a key that may already hold a baseline.
    /// `None` means the key is empty.
    async fn resolve_existing(
        &self,
        case: &CaseId,
        revision: u32,
        path: &Path,
        image: &RgbaImage,
        png: &[u8],
        force: bool,
    ) -> HarnessResult<Option<PutOutcome>> {
        let existing = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if same_pixels(&existing, image) {
            debug!("Baseline {} rev {} unchanged", case, revision);
            return Ok(Some(PutOutcome::Unchanged));
        }

        if !force {
            warn!(
                "Refusing to overwrite baseline {} rev {} with different content",
                case, revision
            );
            return Err(HarnessError::BaselineWriteConflict {
                case: case.label(),
                revision,
                path: path.to_path_buf(),
            });
        }

        let tmp = self.write_temp(path, png).await?;
        fs::rename(&tmp, path).await?;
        info!("Overwrote baseline {} rev {} ({})", case, revision, digest(png));
        Ok(Some(PutOutcome::Overwritten))
    }

    /// Stored revisions of `case`, ascending
    pub async fn list_revisions(&self, case: &CaseId) -> HarnessResult<Vec<u32>> {
        let dir = self.case_dir(case);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".png")) else {
                continue;
            };
            // Skips "1.diff", "1.actual" and temp files
            if let Ok(revision) = stem.parse::<u32>() {
                revisions.push(revision);
            }
        }

        revisions.sort_unstable();
        Ok(revisions)
    }

    /// Highest stored revision not above `revision`.
    ///
    /// Diagnostic only: comparison always uses the exact revision.
    pub async fn latest_at_or_below(
        &self,
        case: &CaseId,
        revision: u32,
    ) -> HarnessResult<Option<u32>> {
        let revisions = self.list_revisions(case).await?;
        Ok(revisions.into_iter().rev().find(|r| *r <= revision))
    }

    /// Keep the latest capture next to the baseline for later promotion
    pub async fn write_actual(
        &self,
        case: &CaseId,
        revision: u32,
        image: &RgbaImage,
    ) -> HarnessResult<PathBuf> {
        let path = self.actual_path(case, revision);
        self.replace_file(&path, &encode_png(image)?).await?;
        Ok(path)
    }

    /// Write a diff image for a failed comparison
    pub async fn write_diff(
        &self,
        case: &CaseId,
        revision: u32,
        image: &RgbaImage,
    ) -> HarnessResult<PathBuf> {
        let path = self.diff_path(case, revision);
        self.replace_file(&path, &encode_png(image)?).await?;
        Ok(path)
    }

    /// Replace the baseline with the last recorded actual capture
    pub async fn promote(&self, case: &CaseId, revision: u32) -> HarnessResult<PutOutcome> {
        let actual = self.actual_path(case, revision);
        let bytes = fs::read(&actual).await?;
        let image = image::load_from_memory(&bytes)?.to_rgba8();
        info!("Promoting {} to baseline", actual.display());
        self.put(case, revision, &image, true).await
    }

    fn lock_for(&self, case: &CaseId, revision: u32) -> Arc<Mutex<()>> {
        self.locks
            .entry((case.clone(), revision))
            .or_default()
            .clone()
    }

    /// Forget the lock for a key once no writer holds or awaits it
    fn release_lock(&self, case: &CaseId, revision: u32) {
        self.locks
            .remove_if(&(case.clone(), revision), |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn write_temp(&self, target: &Path, data: &[u8]) -> HarnessResult<PathBuf> {
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, data).await?;
        Ok(tmp)
    }

    async fn replace_file(&self, path: &Path, data: &[u8]) -> HarnessResult<()> {
        let tmp = self.write_temp(path, data).await?;
        fs::rename(&tmp, path).await?;
        debug!("Wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }
}

fn same_pixels(png: &[u8], image: &RgbaImage) -> bool {
    match image::load_from_memory(png) {
        Ok(existing) => {
            let existing = existing.to_rgba8();
            existing.dimensions() == image.dimensions() && existing.as_raw() == image.as_raw()
        }
        Err(_) => false,
    }
}
