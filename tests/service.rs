#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use exif_stamp::config::{Config, WriteMode};
use exif_stamp::item::{
    BatchResult, ColorLabel, Field, FocusStatus, ItemOutcome, MetadataUpdateItem, Pick, Rating,
};
use exif_stamp::service::MetadataService;
use exif_stamp::StampError;

/// Install the fake exiftool once per test binary. Writing it once, before
/// any test spawns a process, keeps exec from racing an open write handle.
fn fake_exiftool() -> &'static Path {
    static TOOL: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = TOOL.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exiftool");
        fs::write(&path, include_str!("fixtures/fake_exiftool.sh")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink(&path, dir.path().join("exiftool-stalled")).unwrap();
        (dir, path)
    });
    path
}

/// The same tool under a name that makes it stop reading stdin after `-ver`.
fn stalled_exiftool() -> PathBuf {
    fake_exiftool().with_file_name("exiftool-stalled")
}

struct Harness {
    photos: TempDir,
    scratch: TempDir,
    service: MetadataService,
}

impl Harness {
    async fn new() -> Self {
        Self::with(|_| {}).await
    }

    async fn with(customize: impl FnOnce(&mut Config)) -> Self {
        let photos = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut config = Config::default();
        config.exiftool.path = Some(fake_exiftool().to_path_buf());
        config.write.scratch_dir = Some(scratch.path().to_path_buf());
        customize(&mut config);
        let service = MetadataService::new(&config).await.unwrap();
        Self {
            photos,
            scratch,
            service,
        }
    }

    fn photo(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.photos.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.photos.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn field<'a>(fields: &'a exif_stamp::item::FieldValues, field: Field) -> Option<&'a str> {
    fields.get(&field).map(String::as_str)
}

// ── startup ──────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_exiftool_is_unavailable() {
    let mut config = Config::default();
    config.exiftool.path = Some(PathBuf::from("/nonexistent/bin/exiftool"));

    match MetadataService::new(&config).await {
        Err(StampError::ProcessUnavailable { .. }) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("service started without exiftool"),
    }
}

#[tokio::test]
async fn process_starts_lazily() {
    let h = Harness::new().await;
    assert_eq!(h.service.version().await, "13.10");
    assert_eq!(h.service.spawn_count().await, 0);
}

// ── write_batch ──────────────────────────────────────────────────────

#[tokio::test]
async fn single_item_is_one_unit() {
    let h = Harness::new().await;
    let path = h.photo("a.raw", "raw\n");
    let item = MetadataUpdateItem::new(&path)
        .with_rating(Rating::new(3).unwrap())
        .with_pick(Pick::Picked)
        .with_sharpness(512.33);

    let report = h.service.write_batch(&[item]).await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    assert_eq!(report.items[0].outcome, ItemOutcome::Embedded);
    assert_eq!(h.service.coordinator().executions(), 1);

    let fields = h.service.read_embedded(&path).await.unwrap();
    assert_eq!(field(&fields, Field::Rating), Some("3"));
    assert_eq!(field(&fields, Field::Pick), Some("1"));
    assert_eq!(field(&fields, Field::Sharpness), Some("512.33"));
    assert_eq!(field(&fields, Field::Label), None);
}

#[tokio::test]
async fn missing_file_fails_only_that_item() {
    let h = Harness::new().await;
    let present = h.photo("a.jpg", "jpeg\n");
    let missing = h.photos.path().join("gone.jpg");
    let items = [
        MetadataUpdateItem::new(&present).with_label(ColorLabel::Red),
        MetadataUpdateItem::new(&missing).with_label(ColorLabel::Red),
    ];

    let report = h.service.write_batch(&items).await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 1 });
    assert_eq!(report.failed_paths(), vec![missing.as_path()]);
}

#[tokio::test]
async fn empty_item_sends_nothing() {
    let h = Harness::new().await;
    let path = h.photo("a.jpg", "jpeg\n");

    let outcome = h.service.write_one(&MetadataUpdateItem::new(&path)).await;

    assert_eq!(outcome, ItemOutcome::Unchanged);
    assert_eq!(h.service.coordinator().executions(), 0);
    assert_eq!(h.service.spawn_count().await, 0);
}

#[tokio::test]
async fn captions_use_scratch_files_that_are_removed() {
    let h = Harness::new().await;
    let items: Vec<MetadataUpdateItem> = (0..50)
        .map(|i| {
            let path = h.photo(&format!("{i:03}.jpg"), "jpeg\n");
            MetadataUpdateItem::new(path)
                .with_caption(format!("Caption {i}\n\"quoted\" & $HOME"))
                .with_focus_status(FocusStatus::Best)
        })
        .collect();

    let report = h.service.write_batch(&items).await;

    assert_eq!(report.result, BatchResult { success: 50, failed: 0 });
    assert_eq!(fs::read_dir(h.scratch.path()).unwrap().count(), 0);

    let fields = h.service.read_embedded(items[7].path()).await.unwrap();
    assert_eq!(field(&fields, Field::Caption), Some("Caption 7 \"quoted\" & $HOME"));
    assert_eq!(field(&fields, Field::FocusStatus), Some("BEST"));
}

#[tokio::test]
async fn line_break_in_path_fails_before_sending() {
    let h = Harness::new().await;
    let path = h.photo("bad\nname.jpg", "jpeg\n");

    let report = h
        .service
        .write_batch(&[MetadataUpdateItem::new(&path).with_rating(Rating::new(1).unwrap())])
        .await;

    assert_eq!(report.result, BatchResult { success: 0, failed: 1 });
    assert_eq!(h.service.coordinator().executions(), 0);
}

#[tokio::test]
async fn stale_artifact_is_removed_before_writing() {
    let h = Harness::new().await;
    let path = h.photo("a.jpg", "jpeg\n");
    let artifact = h.photos.path().join("a.jpg_exiftool_tmp");
    fs::write(&artifact, "partial").unwrap();

    let report = h
        .service
        .write_batch(&[MetadataUpdateItem::new(&path).with_rating(Rating::new(2).unwrap())])
        .await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    assert!(!artifact.exists());
}

#[tokio::test]
async fn tool_rejection_fails_only_that_unit() {
    let h = Harness::new().await;
    let a = h.photo("a.jpg", "jpeg\n");
    let b = h.photo("b.jpg", "jpeg\nREJECT\n");
    let c = h.photo("c.jpg", "jpeg\n");
    let items: Vec<MetadataUpdateItem> = [&a, &b, &c]
        .into_iter()
        .map(|p| MetadataUpdateItem::new(p).with_pick(Pick::Rejected))
        .collect();

    let report = h.service.write_batch(&items).await;

    assert_eq!(report.result, BatchResult { success: 2, failed: 1 });
    assert_eq!(report.failed_paths(), vec![b.as_path()]);
    assert_eq!(h.service.spawn_count().await, 1);
}

#[tokio::test]
async fn mirrored_format_also_gets_sidecar() {
    let h = Harness::new().await;
    let path = h.photo("DSCF0001.RAF", "raw\n");
    let item = MetadataUpdateItem::new(&path).with_label(ColorLabel::Blue);

    let report = h.service.write_batch(&[item]).await;

    assert_eq!(report.items[0].outcome, ItemOutcome::Embedded);
    let sidecar = h.service.sidecar().read(&path).unwrap().unwrap();
    assert_eq!(field(&sidecar, Field::Label), Some("Blue"));
}

// ── fragile format ───────────────────────────────────────────────────

#[tokio::test]
async fn auto_mode_commits_when_structure_is_stable() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Auto).await;
    let path = h.photo("DSC0001.ARW", "raw\n");

    let outcome = h
        .service
        .write_one(&MetadataUpdateItem::new(&path).with_rating(Rating::new(3).unwrap()))
        .await;

    assert_eq!(outcome, ItemOutcome::Committed);
    assert_eq!(h.entries(), vec!["DSC0001.ARW"]);
    let fields = h.service.read_embedded(&path).await.unwrap();
    assert_eq!(field(&fields, Field::Rating), Some("3"));
}

#[tokio::test]
async fn auto_mode_falls_back_to_sidecar_on_drift() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Auto).await;
    let path = h.photo("DSC0002.ARW", "raw\nDRIFT\n");
    let before = fs::read(&path).unwrap();
    let item = MetadataUpdateItem::new(&path)
        .with_rating(Rating::new(2).unwrap())
        .with_caption("Heron");

    let report = h.service.write_batch(&[item]).await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    let sidecar_path = h.photos.path().join("DSC0002.xmp");
    assert_eq!(report.items[0].outcome, ItemOutcome::Sidecar(sidecar_path.clone()));
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(h.entries(), vec!["DSC0002.ARW", "DSC0002.xmp"]);

    let sidecar = h.service.sidecar().read(&path).unwrap().unwrap();
    assert_eq!(field(&sidecar, Field::Rating), Some("2"));
    assert_eq!(field(&sidecar, Field::Caption), Some("Heron"));
    assert_eq!(fs::read_dir(h.scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn auto_mode_falls_back_to_sidecar_when_unreadable() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Auto).await;
    let path = h.photo("DSC0008.ARW", "raw\nUNREADABLE\n");
    let before = fs::read(&path).unwrap();
    let item = MetadataUpdateItem::new(&path)
        .with_rating(Rating::new(2).unwrap())
        .with_caption("Grebe");

    let report = h.service.write_batch(&[item]).await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    let sidecar_path = h.photos.path().join("DSC0008.xmp");
    assert_eq!(report.items[0].outcome, ItemOutcome::Sidecar(sidecar_path));
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(h.entries(), vec!["DSC0008.ARW", "DSC0008.xmp"]);

    let sidecar = h.service.sidecar().read(&path).unwrap().unwrap();
    assert_eq!(field(&sidecar, Field::Rating), Some("2"));
    assert_eq!(field(&sidecar, Field::Caption), Some("Grebe"));
}

#[tokio::test]
async fn auto_commit_updates_earlier_sidecar() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Sidecar).await;
    let path = h.photo("DSC0009.ARW", "raw\n");
    let rated = |stars| MetadataUpdateItem::new(&path).with_rating(Rating::new(stars).unwrap());

    assert!(matches!(h.service.write_one(&rated(1)).await, ItemOutcome::Sidecar(_)));

    h.service.set_write_mode(WriteMode::Auto);
    assert_eq!(h.service.write_one(&rated(3)).await, ItemOutcome::Committed);

    let embedded = h.service.read_embedded(&path).await.unwrap();
    assert_eq!(field(&embedded, Field::Rating), Some("3"));
    let sidecar = h.service.sidecar().read(&path).unwrap().unwrap();
    assert_eq!(field(&sidecar, Field::Rating), Some("3"));
    let fields = h.service.read_fields(&path).await.unwrap();
    assert_eq!(field(&fields, Field::Rating), Some("3"));
}

#[tokio::test]
async fn in_place_mode_writes_through_original() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Sidecar).await;
    let path = h.photo("DSC0010.ARW", "raw\n");
    let labelled = |label| MetadataUpdateItem::new(&path).with_label(label);
    h.service.write_one(&labelled(ColorLabel::Red)).await;

    h.service.set_write_mode(WriteMode::InPlace);
    let report = h.service.write_batch(&[labelled(ColorLabel::Green)]).await;

    assert_eq!(report.items[0].outcome, ItemOutcome::Embedded);
    assert_eq!(h.service.coordinator().executions(), 1);
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("Mode=-overwrite_original_in_place"), "{contents}");
    assert_eq!(h.entries(), vec!["DSC0010.ARW", "DSC0010.xmp"]);

    let fields = h.service.read_fields(&path).await.unwrap();
    assert_eq!(field(&fields, Field::Label), Some("Green"));

    let report = h.service.reset(&[path.clone()]).await;
    assert_eq!(report.items[0].outcome, ItemOutcome::Embedded);
    assert!(h.service.read_fields(&path).await.unwrap().is_empty());
}

#[tokio::test]
async fn sidecar_mode_never_touches_original() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Sidecar).await;
    let path = h.photo("DSC0003.arw", "raw\n");

    let report = h
        .service
        .write_batch(&[MetadataUpdateItem::new(&path).with_pick(Pick::Picked)])
        .await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    assert_eq!(fs::read_to_string(&path).unwrap(), "raw\n");
    assert_eq!(h.service.coordinator().executions(), 0);
    assert_eq!(report.sidecars().len(), 1);
}

#[tokio::test]
async fn write_mode_switch_applies_to_next_call() {
    let h = Harness::new().await;
    let path = h.photo("DSC0004.ARW", "raw\n");
    let item = MetadataUpdateItem::new(&path).with_title("Kestrel");

    assert_eq!(h.service.write_one(&item).await, ItemOutcome::Embedded);

    h.service.set_write_mode(WriteMode::Sidecar);
    assert_eq!(h.service.write_mode(), WriteMode::Sidecar);
    assert!(matches!(h.service.write_one(&item).await, ItemOutcome::Sidecar(_)));

    let fields = h.service.read_fields(&path).await.unwrap();
    assert_eq!(field(&fields, Field::Title), Some("Kestrel"));
}

// ── recovery and concurrency ─────────────────────────────────────────

#[tokio::test]
async fn timeout_restarts_and_next_call_succeeds() {
    let h = Harness::with(|c| {
        c.timeouts.floor_ms = 1_000;
        c.timeouts.per_unit_ms = 10;
    })
    .await;
    let hang = h.photo("hang.jpg", "jpeg\nHANG\n");
    let ok = h.photo("ok.jpg", "jpeg\n");

    let started = Instant::now();
    let report = h
        .service
        .write_batch(&[MetadataUpdateItem::new(&hang).with_rating(Rating::new(1).unwrap())])
        .await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(report.result, BatchResult { success: 0, failed: 1 });

    let report = h
        .service
        .write_batch(&[MetadataUpdateItem::new(&ok).with_rating(Rating::new(1).unwrap())])
        .await;
    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    assert_eq!(h.service.spawn_count().await, 2);
}

#[tokio::test]
async fn stalled_process_times_out_with_full_input_pipe() {
    let h = Harness::with(|c| {
        c.exiftool.path = Some(stalled_exiftool());
        c.timeouts.floor_ms = 1_000;
        c.timeouts.per_unit_ms = 1;
    })
    .await;
    // Well over a pipe buffer of commands once every path is spelled out.
    let stem = "x".repeat(150);
    let items: Vec<MetadataUpdateItem> = (0..600)
        .map(|i| {
            let path = h.photo(&format!("{stem}{i:03}.jpg"), "jpeg\n");
            MetadataUpdateItem::new(path).with_rating(Rating::new(1).unwrap())
        })
        .collect();

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(10), h.service.write_batch(&items))
        .await
        .expect("write to a stalled exiftool never returned");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.result, BatchResult { success: 0, failed: 600 });
    assert_eq!(h.service.spawn_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_get_their_own_outcome() {
    let h = Harness::new().await;
    let paths: Vec<PathBuf> = (0..8).map(|i| h.photo(&format!("{i}.jpg"), "jpeg\n")).collect();
    let service = Arc::new(h.service);

    let mut tasks = Vec::new();
    for (i, path) in paths.iter().cloned().enumerate() {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let rating = Rating::new((i % 4) as i8).unwrap();
            let report = service
                .write_batch(&[MetadataUpdateItem::new(&path).with_rating(rating)])
                .await;
            (path, report)
        }));
    }

    for task in tasks {
        let (path, report) = task.await.unwrap();
        assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].path, path);
    }
    for (i, path) in paths.iter().enumerate() {
        let fields = service.read_embedded(path).await.unwrap();
        assert_eq!(field(&fields, Field::Rating), Some((i % 4).to_string().as_str()));
    }
    assert_eq!(service.spawn_count().await, 1);
}

#[tokio::test]
async fn shutdown_then_next_call_respawns() {
    let h = Harness::new().await;
    let path = h.photo("a.jpg", "jpeg\n");
    let item = MetadataUpdateItem::new(&path).with_aesthetic_score(4.99);

    assert_eq!(h.service.write_one(&item).await, ItemOutcome::Embedded);
    h.service.shutdown().await;
    h.service.shutdown().await;
    assert_eq!(h.service.write_one(&item).await, ItemOutcome::Embedded);
    assert_eq!(h.service.spawn_count().await, 2);
}

#[tokio::test]
async fn counted_execute_reports_units() {
    let h = Harness::new().await;
    let path = h.photo("a.jpg", "jpeg\n");
    let unit = h.service.batcher().read_unit(&path, &["Rating"], false).unwrap();

    let result = h.service.coordinator().execute_counted(&[unit.clone(), unit]).await;

    assert_eq!(result, BatchResult { success: 2, failed: 0 });
}

// ── reset ────────────────────────────────────────────────────────────

#[tokio::test]
async fn reset_is_chunked_and_clears_everything() {
    let h = Harness::new().await;
    let paths: Vec<PathBuf> = (0..120)
        .map(|i| h.photo(&format!("{i:03}.jpg"), "jpeg\n"))
        .collect();
    let items: Vec<MetadataUpdateItem> = paths
        .iter()
        .map(|p| {
            MetadataUpdateItem::new(p)
                .with_rating(Rating::new(2).unwrap())
                .with_label(ColorLabel::Yellow)
        })
        .collect();
    assert_eq!(h.service.write_batch(&items).await.result.failed, 0);

    let before = h.service.coordinator().executions();
    let report = h.service.reset(&paths).await;

    assert_eq!(report.result, BatchResult { success: 120, failed: 0 });
    assert_eq!(h.service.coordinator().executions() - before, 3);
    for path in &paths {
        let fields = h.service.read_embedded(path).await.unwrap();
        assert!(fields.is_empty(), "{}: {fields:?}", path.display());
    }
}

#[tokio::test]
async fn sidecar_reset_keeps_foreign_content() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Sidecar).await;
    let path = h.photo("DSC0005.ARW", "raw\n");
    let item = MetadataUpdateItem::new(&path)
        .with_rating(Rating::new(3).unwrap())
        .with_title("Owl");
    h.service.write_one(&item).await;

    let sidecar_path = h.photos.path().join("DSC0005.xmp");
    let xmp = fs::read_to_string(&sidecar_path).unwrap().replace(
        "</rdf:Description>",
        "  <xmp:CreatorTool>Other</xmp:CreatorTool>\n</rdf:Description>",
    );
    fs::write(&sidecar_path, xmp).unwrap();

    let report = h.service.reset(&[path.clone()]).await;

    assert_eq!(report.items[0].outcome, ItemOutcome::Sidecar(sidecar_path.clone()));
    assert!(h.service.sidecar().read(&path).unwrap().unwrap().is_empty());
    assert!(fs::read_to_string(&sidecar_path).unwrap().contains("<xmp:CreatorTool>Other</xmp:CreatorTool>"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "raw\n");
}

#[tokio::test]
async fn sidecar_reset_without_sidecar_is_unchanged() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Sidecar).await;
    let path = h.photo("DSC0006.ARW", "raw\n");

    let report = h.service.reset(&[path]).await;

    assert_eq!(report.result, BatchResult { success: 1, failed: 0 });
    assert_eq!(report.items[0].outcome, ItemOutcome::Unchanged);
}

#[tokio::test]
async fn auto_reset_clears_committed_fields() {
    let h = Harness::with(|c| c.write.fragile_write_mode = WriteMode::Auto).await;
    let path = h.photo("DSC0007.ARW", "raw\n");
    let item = MetadataUpdateItem::new(&path).with_label(ColorLabel::Purple);
    assert_eq!(h.service.write_one(&item).await, ItemOutcome::Committed);

    let report = h.service.reset(&[path.clone()]).await;

    assert_eq!(report.items[0].outcome, ItemOutcome::Committed);
    assert!(h.service.read_fields(&path).await.unwrap().is_empty());
    assert_eq!(h.entries(), vec!["DSC0007.ARW"]);
}
