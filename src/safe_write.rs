//! Verified writes for the fragile format.
//!
//! The write runs against a trial copy. The copy replaces the original only
//! when its structural signature (offsets and lengths of embedded image data)
//! is unchanged; otherwise the copy is thrown away and the update goes to the
//! sidecar. The original is never touched before the verdict.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::{Builder, TempPath};

use crate::error::{Result, StampError};
use crate::exiftool::query::{read_tags, value_text};
use crate::exiftool::{
    CommandBatcher, ExecutionCoordinator, Overwrite, ScratchFiles, Unit, UnitOutput,
    in_progress_artifact,
};
use crate::item::{ItemOutcome, MetadataUpdateItem};
use crate::sidecar::SidecarWriter;

/// Offset/length tags whose values change when a write moves image data.
///
/// `FileSize` is not among them: any metadata write may grow the file
/// without moving anything.
pub const STRUCTURAL_TAGS: [&str; 16] = [
    "FileType",
    "FileTypeExtension",
    "MIMEType",
    "PreviewImageStart",
    "PreviewImageLength",
    "ThumbnailOffset",
    "ThumbnailLength",
    "JpgFromRawStart",
    "JpgFromRawLength",
    "OtherImageStart",
    "OtherImageLength",
    "HiddenDataOffset",
    "HiddenDataLength",
    "SR2SubIFDOffset",
    "StripOffsets",
    "StripByteCounts",
];

const TRIAL_PREFIX: &str = ".exif-stamp-";

/// Raw values of [`STRUCTURAL_TAGS`] for one file, in tag order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralSignature {
    entries: Vec<(&'static str, Option<String>)>,
}

impl StructuralSignature {
    pub fn from_tags(tags: &Map<String, Value>) -> Self {
        let entries = STRUCTURAL_TAGS
            .iter()
            .map(|tag| (*tag, tags.get(*tag).and_then(value_text)))
            .collect();
        Self { entries }
    }

    /// Read the signature of `path` with print conversion disabled.
    pub async fn read(
        coordinator: &ExecutionCoordinator,
        batcher: &CommandBatcher,
        path: &Path,
    ) -> Result<Self> {
        let tags = read_tags(coordinator, batcher, path, &STRUCTURAL_TAGS, true).await?;
        if let Some(error) = tags.get("Error").and_then(value_text) {
            return Err(StampError::Unreadable {
                path: path.to_path_buf(),
                reason: error,
            });
        }
        Ok(Self::from_tags(&tags))
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| *name == tag)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Tags whose values differ between `self` and `other`.
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        self.entries
            .iter()
            .zip(&other.entries)
            .filter(|(a, b)| a.1 != b.1)
            .map(|(a, _)| a.0)
            .collect()
    }
}

/// Verdict of a verified write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    /// The trial copy matched and now is the original.
    Committed,
    /// The write moved structural data. The original is untouched.
    Drifted { changed: Vec<&'static str> },
}

/// Removes exiftool's in-progress artifact for the trial copy.
struct ArtifactGuard(PathBuf);

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        let artifact = in_progress_artifact(&self.0);
        if artifact.exists() {
            if let Err(e) = fs::remove_file(&artifact) {
                log::warn!("Failed to remove {}: {e}", artifact.display());
            }
        }
    }
}

/// Copy/write/verify/commit for one file at a time.
pub struct SafeWriteVerifier<'a> {
    coordinator: &'a ExecutionCoordinator,
    batcher: &'a CommandBatcher,
    sidecar: &'a SidecarWriter,
}

impl<'a> SafeWriteVerifier<'a> {
    pub fn new(
        coordinator: &'a ExecutionCoordinator,
        batcher: &'a CommandBatcher,
        sidecar: &'a SidecarWriter,
    ) -> Self {
        Self {
            coordinator,
            batcher,
            sidecar,
        }
    }

    /// Run the unit built by `build_unit` against a trial copy of `path` and
    /// commit it only if the structural signature is unchanged.
    ///
    /// `build_unit` receives the trial copy's path. The copy is removed on
    /// every path except a successful commit.
    pub async fn apply<F>(&self, path: &Path, build_unit: F) -> Result<Verified>
    where
        F: FnOnce(&Path) -> Result<Unit>,
    {
        let before = StructuralSignature::read(self.coordinator, self.batcher, path).await?;

        let trial = trial_copy(path)?;
        let trial_path: &Path = &trial;
        let _artifact = ArtifactGuard(trial_path.to_path_buf());

        let unit = build_unit(trial_path)?;
        let outputs = self.coordinator.execute(std::slice::from_ref(&unit)).await?;
        if let Some(reason) = outputs.first().and_then(UnitOutput::error) {
            return Err(StampError::Rejected {
                path: path.to_path_buf(),
                reason,
            });
        }

        let after = StructuralSignature::read(self.coordinator, self.batcher, trial_path).await?;
        let changed = before.diff(&after);
        if !changed.is_empty() {
            return Ok(Verified::Drifted { changed });
        }

        commit(trial, path)?;
        Ok(Verified::Committed)
    }

    /// Auto-mode write of `item`: verified in place, or the sidecar.
    ///
    /// Drift and an unreadable signature both end in the sidecar and count as
    /// success. A write exiftool rejects is an error.
    pub async fn write(&self, item: &MetadataUpdateItem) -> Result<ItemOutcome> {
        let mut scratch = ScratchFiles::default();
        let verdict = self
            .apply(item.path(), |target| {
                self.batcher
                    .write_unit(item, target, Overwrite::InPlace, &mut scratch)
            })
            .await;

        match verdict {
            Ok(Verified::Committed) => {
                log::debug!("Verified write committed: {}", item.path().display());
                // An earlier fallback's sidecar would otherwise shadow the
                // committed values.
                if let Err(e) = self.sidecar.refresh(item) {
                    log::warn!("Failed to update sidecar of {}: {e}", item.path().display());
                }
                Ok(ItemOutcome::Committed)
            }
            Ok(Verified::Drifted { changed }) => {
                log::info!(
                    "Structural drift in {} ({}), writing sidecar instead",
                    item.path().display(),
                    changed.join(", ")
                );
                self.fall_back(item)
            }
            Err(StampError::Unreadable { reason, .. }) => {
                log::info!(
                    "Cannot verify {} ({reason}), writing sidecar instead",
                    item.path().display()
                );
                self.fall_back(item)
            }
            Err(e) => Err(e),
        }
    }

    /// Verified removal of the owned fields embedded in `path`.
    pub async fn clear(&self, path: &Path) -> Result<Verified> {
        self.apply(path, |target| {
            self.batcher.clear_unit(target, Overwrite::InPlace)
        })
        .await
    }

    fn fall_back(&self, item: &MetadataUpdateItem) -> Result<ItemOutcome> {
        let sidecar = self.sidecar.write(item)?;
        Ok(ItemOutcome::Sidecar(sidecar))
    }
}

/// Byte-for-byte copy of `path` in the same directory, keeping the extension
/// so exiftool recognizes the format. Deleted when dropped.
fn trial_copy(path: &Path) -> Result<TempPath> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let trial = Builder::new()
        .prefix(TRIAL_PREFIX)
        .suffix(&suffix)
        .tempfile_in(dir)?
        .into_temp_path();
    fs::copy(path, &trial)?;
    Ok(trial)
}

/// Replace `original` with the verified `trial`.
///
/// Normally a rename, so `original` never holds a partially written file. The
/// trial already carries the original's permission bits from [`trial_copy`].
/// A hard-linked original is overwritten in place instead, keeping its inode
/// so every link sees the update.
fn commit(trial: TempPath, original: &Path) -> Result<()> {
    if has_other_links(original)? {
        fs::copy(&trial, original)?;
        return Ok(());
    }
    trial.persist(original).map_err(|e| StampError::Io(e.error))
}

#[cfg(unix)]
fn has_other_links(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.nlink() > 1)
}

#[cfg(not(unix))]
fn has_other_links(_path: &Path) -> Result<bool> {
    Ok(false)
}
