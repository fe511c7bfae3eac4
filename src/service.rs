//! The metadata-write service: batched writes, resets and minimal reads
//! through one persistent exiftool process.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::config::{Config, WriteMode};
use crate::error::{Result, StampError};
use crate::exiftool::query::{owned_fields, owned_tags, read_tags, value_text};
use crate::exiftool::{
    CommandBatcher, ExecutionCoordinator, Overwrite, ProcessSupervisor, ScratchFiles, Unit,
    remove_stale_artifacts,
};
use crate::format::FileKind;
use crate::item::{FieldValues, ItemOutcome, MetadataUpdateItem, WriteReport};
use crate::safe_write::{SafeWriteVerifier, Verified};
use crate::sidecar::SidecarWriter;

/// How one submitted item is handled within a call.
enum Plan {
    /// Settled before anything was sent.
    Done(ItemOutcome),
    /// Unit at this index of the call's direct batch.
    Direct(usize),
    /// Auto mode on the fragile format.
    Verified,
    /// Sidecar only; the original is never touched.
    Sidecar,
}

/// Persistent metadata-write service.
///
/// Cheap to share behind an `Arc`: every call serializes on the
/// coordinator's lock only for the time its units are in flight.
///
/// # Example
///
/// ```rust,no_run
/// use exif_stamp::config::Config;
/// use exif_stamp::item::{MetadataUpdateItem, Pick, Rating};
/// use exif_stamp::service::MetadataService;
///
/// # async fn example() -> exif_stamp::error::Result<()> {
/// let service = MetadataService::new(&Config::default()).await?;
///
/// let item = MetadataUpdateItem::new("DSC0001.ARW")
///     .with_rating(Rating::new(3).unwrap())
///     .with_pick(Pick::Picked)
///     .with_sharpness(512.33);
/// let report = service.write_batch(&[item]).await;
/// println!("{} ok, {} failed", report.result.success, report.result.failed);
///
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MetadataService {
    coordinator: ExecutionCoordinator,
    batcher: CommandBatcher,
    sidecar: SidecarWriter,
    write_mode: RwLock<WriteMode>,
    reset_chunk_size: usize,
}

impl MetadataService {
    /// Probe exiftool and build the service. No session is started until the
    /// first call that needs one.
    pub async fn new(config: &Config) -> Result<Self> {
        let program = config.exiftool.resolve();
        let supervisor = ProcessSupervisor::new(program, config.exiftool.probe_timeout()).await?;
        Ok(Self::with_supervisor(supervisor, config))
    }

    /// Build the service around an already probed supervisor.
    pub fn with_supervisor(supervisor: ProcessSupervisor, config: &Config) -> Self {
        Self {
            coordinator: ExecutionCoordinator::new(supervisor, config.timeouts.policy()),
            batcher: CommandBatcher::new(config.write.scratch_dir.clone()),
            sidecar: SidecarWriter::new(),
            write_mode: RwLock::new(config.write.fragile_write_mode),
            reset_chunk_size: config.write.reset_chunk_size.max(1),
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        match self.write_mode.read() {
            Ok(mode) => *mode,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Change how the fragile format is written from the next call on.
    pub fn set_write_mode(&self, mode: WriteMode) {
        let mut guard = match self.write_mode.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != mode {
            log::info!("Fragile write mode: {} -> {mode}", *guard);
            *guard = mode;
        }
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn batcher(&self) -> &CommandBatcher {
        &self.batcher
    }

    pub fn sidecar(&self) -> &SidecarWriter {
        &self.sidecar
    }

    pub fn reset_chunk_size(&self) -> usize {
        self.reset_chunk_size
    }

    fn verifier(&self) -> SafeWriteVerifier<'_> {
        SafeWriteVerifier::new(&self.coordinator, &self.batcher, &self.sidecar)
    }

    /// Apply `items`, reporting one outcome per item in submission order.
    ///
    /// Direct writes share one execute call; Auto-mode writes of the fragile
    /// format run one at a time through the verifier afterwards.
    pub async fn write_batch(&self, items: &[MetadataUpdateItem]) -> WriteReport {
        let mut report = WriteReport::with_capacity(items.len());
        if items.is_empty() {
            return report;
        }

        remove_stale_artifacts(items.iter().map(MetadataUpdateItem::path));
        let mode = self.write_mode();

        let mut scratch = ScratchFiles::default();
        let mut units = Vec::new();
        let plans: Vec<Plan> = items
            .iter()
            .map(|item| self.plan_write(item, mode, &mut units, &mut scratch))
            .collect();

        let direct = self.run_direct(&units).await;
        drop(scratch);

        for (item, plan) in items.iter().zip(plans) {
            let outcome = match plan {
                Plan::Done(outcome) => outcome,
                Plan::Direct(index) => {
                    let outcome = direct[index].clone();
                    if outcome.is_success() {
                        self.mirror(item);
                    }
                    outcome
                }
                Plan::Sidecar => match self.sidecar.write(item) {
                    Ok(path) => ItemOutcome::Sidecar(path),
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                },
                Plan::Verified => match self.verifier().write(item).await {
                    Ok(outcome) => outcome,
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                },
            };
            if let ItemOutcome::Failed(ref reason) = outcome {
                log::warn!("Write failed for {}: {reason}", item.path().display());
            }
            report.push(item.path(), outcome);
        }

        log::info!(
            "Metadata write: {} ok, {} failed ({} item(s), mode {mode})",
            report.result.success,
            report.result.failed,
            items.len()
        );
        report
    }

    /// Apply a single item.
    pub async fn write_one(&self, item: &MetadataUpdateItem) -> ItemOutcome {
        let mut report = self.write_batch(std::slice::from_ref(item)).await;
        match report.items.pop() {
            Some(item) => item.outcome,
            None => ItemOutcome::Unchanged,
        }
    }

    fn plan_write(
        &self,
        item: &MetadataUpdateItem,
        mode: WriteMode,
        units: &mut Vec<Unit>,
        scratch: &mut ScratchFiles,
    ) -> Plan {
        let path = item.path();
        if !path.exists() {
            return Plan::Done(ItemOutcome::Failed(StampError::FileNotFound(path.to_path_buf()).to_string()));
        }
        if item.is_empty() {
            return Plan::Done(ItemOutcome::Unchanged);
        }

        let overwrite = match (FileKind::from_path(path), mode) {
            (FileKind::Fragile, WriteMode::Sidecar) => return Plan::Sidecar,
            (FileKind::Fragile, WriteMode::Auto) => return Plan::Verified,
            (FileKind::Fragile, WriteMode::InPlace) => Overwrite::InPlace,
            _ => Overwrite::Replace,
        };

        match self.batcher.write_unit(item, path, overwrite, scratch) {
            Ok(unit) => {
                units.push(unit);
                Plan::Direct(units.len() - 1)
            }
            Err(e) => Plan::Done(ItemOutcome::Failed(e.to_string())),
        }
    }

    /// Send the direct units as one call. A failed call fails every unit in
    /// it; a unit exiftool rejected fails only that unit.
    async fn run_direct(&self, units: &[Unit]) -> Vec<ItemOutcome> {
        match self.coordinator.execute(units).await {
            Ok(outputs) => outputs
                .iter()
                .map(|output| match output.error() {
                    Some(reason) => ItemOutcome::Failed(reason),
                    None => ItemOutcome::Embedded,
                })
                .collect(),
            Err(e) => {
                let reason = e.to_string();
                units.iter().map(|_| ItemOutcome::Failed(reason.clone())).collect()
            }
        }
    }

    /// Copy a successful embedded write into the sidecar: always for the
    /// mirrored formats, and for the fragile one only when a sidecar already
    /// exists. Failures here do not fail the write.
    fn mirror(&self, item: &MetadataUpdateItem) {
        let written = match FileKind::from_path(item.path()) {
            FileKind::Mirrored => self.sidecar.write(item).map(Some),
            FileKind::Fragile => self.sidecar.refresh(item),
            FileKind::Standard => Ok(None),
        };
        match written {
            Ok(Some(path)) => log::debug!("Mirrored to sidecar: {}", path.display()),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to mirror {} to sidecar: {e}", item.path().display()),
        }
    }

    /// Clear every owned field from `paths`, in chunks of the configured size.
    pub async fn reset(&self, paths: &[PathBuf]) -> WriteReport {
        let mut report = WriteReport::with_capacity(paths.len());
        if paths.is_empty() {
            return report;
        }

        remove_stale_artifacts(paths.iter().map(PathBuf::as_path));
        let mode = self.write_mode();

        for (index, chunk) in chunks(paths, self.reset_chunk_size).enumerate() {
            log::debug!("Reset chunk {} ({} file(s))", index + 1, chunk.len());
            report.extend(self.reset_chunk(chunk, mode).await);
        }

        log::info!(
            "Metadata reset: {} ok, {} failed ({} file(s), mode {mode})",
            report.result.success,
            report.result.failed,
            paths.len()
        );
        report
    }

    async fn reset_chunk(&self, paths: &[PathBuf], mode: WriteMode) -> WriteReport {
        let mut units = Vec::new();
        let plans: Vec<Plan> = paths
            .iter()
            .map(|path| self.plan_reset(path, mode, &mut units))
            .collect();

        let direct = self.run_direct(&units).await;

        let mut report = WriteReport::with_capacity(paths.len());
        for (path, plan) in paths.iter().zip(plans) {
            let outcome = match plan {
                Plan::Done(outcome) => outcome,
                Plan::Direct(index) => {
                    let outcome = direct[index].clone();
                    if outcome.is_success() && FileKind::from_path(path) != FileKind::Standard {
                        if let Err(e) = self.sidecar.clear(path) {
                            log::warn!("Failed to clear sidecar of {}: {e}", path.display());
                        }
                    }
                    outcome
                }
                Plan::Sidecar => match self.sidecar.clear(path) {
                    Ok(Some(sidecar)) => ItemOutcome::Sidecar(sidecar),
                    Ok(None) => ItemOutcome::Unchanged,
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                },
                Plan::Verified => self.reset_verified(path).await,
            };
            if let ItemOutcome::Failed(ref reason) = outcome {
                log::warn!("Reset failed for {}: {reason}", path.display());
            }
            report.push(path.as_path(), outcome);
        }
        report
    }

    fn plan_reset(&self, path: &Path, mode: WriteMode, units: &mut Vec<Unit>) -> Plan {
        if !path.exists() {
            return Plan::Done(ItemOutcome::Failed(StampError::FileNotFound(path.to_path_buf()).to_string()));
        }

        let overwrite = match (FileKind::from_path(path), mode) {
            (FileKind::Fragile, WriteMode::Sidecar) => return Plan::Sidecar,
            (FileKind::Fragile, WriteMode::Auto) => return Plan::Verified,
            (FileKind::Fragile, WriteMode::InPlace) => Overwrite::InPlace,
            _ => Overwrite::Replace,
        };

        match self.batcher.clear_unit(path, overwrite) {
            Ok(unit) => {
                units.push(unit);
                Plan::Direct(units.len() - 1)
            }
            Err(e) => Plan::Done(ItemOutcome::Failed(e.to_string())),
        }
    }

    /// Auto-mode reset of a fragile file: clear the sidecar, then remove any
    /// fields an earlier verified write committed into the file itself.
    async fn reset_verified(&self, path: &Path) -> ItemOutcome {
        let sidecar = match self.sidecar.clear(path) {
            Ok(sidecar) => sidecar,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };

        let embedded = match self.read_embedded(path).await {
            Ok(fields) => fields,
            Err(StampError::Unreadable { reason, .. }) => {
                log::info!("Cannot read {} ({reason}); only the sidecar was reset", path.display());
                return sidecar.map_or(ItemOutcome::Unchanged, ItemOutcome::Sidecar);
            }
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };
        if embedded.is_empty() {
            return sidecar.map_or(ItemOutcome::Unchanged, ItemOutcome::Sidecar);
        }

        match self.verifier().clear(path).await {
            Ok(Verified::Committed) => ItemOutcome::Committed,
            Ok(Verified::Drifted { changed }) => ItemOutcome::Failed(format!(
                "clearing embedded fields would move {}; file left untouched",
                changed.join(", ")
            )),
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }

    /// Owned fields embedded in `path`, as exiftool reports them.
    pub async fn read_embedded(&self, path: &Path) -> Result<FieldValues> {
        if !path.exists() {
            return Err(StampError::FileNotFound(path.to_path_buf()));
        }
        let tags = read_tags(&self.coordinator, &self.batcher, path, &owned_tags(), true).await?;
        if let Some(error) = tags.get("Error").and_then(value_text) {
            return Err(StampError::Unreadable {
                path: path.to_path_buf(),
                reason: error,
            });
        }
        Ok(owned_fields(&tags))
    }

    /// Owned fields as a catalog would show them: embedded values overlaid
    /// with the sidecar's.
    pub async fn read_fields(&self, path: &Path) -> Result<FieldValues> {
        let mut fields = self.read_embedded(path).await?;
        if let Some(sidecar) = self.sidecar.read(path)? {
            fields.extend(sidecar);
        }
        Ok(fields)
    }

    /// End the exiftool session. A later call starts a new one.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    /// Processes started so far, restarts included.
    pub async fn spawn_count(&self) -> u64 {
        self.coordinator.spawn_count().await
    }

    pub async fn version(&self) -> String {
        self.coordinator.version().await
    }
}

/// Split `paths` into groups of at most `size` (at least one).
pub fn chunks(paths: &[PathBuf], size: usize) -> std::slice::Chunks<'_, PathBuf> {
    paths.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_split_reset_sets() {
        let paths: Vec<PathBuf> = (0..120).map(|i| PathBuf::from(format!("{i}.jpg"))).collect();
        let sizes: Vec<usize> = chunks(&paths, 50).map(<[PathBuf]>::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[test]
    fn chunk_size_zero_is_one() {
        let paths = vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")];
        assert_eq!(chunks(&paths, 0).count(), 2);
    }
}
