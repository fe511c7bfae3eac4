//! # exif-stamp
//!
//! Persistent metadata-write service for photo culling tools: ratings, picks,
//! color labels, sharpness/aesthetic scores, focus status, captions and titles
//! written through a single long-running `exiftool -stay_open` process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exif_stamp::config::Config;
//! use exif_stamp::item::{ColorLabel, MetadataUpdateItem, Rating};
//! use exif_stamp::service::MetadataService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load config from file (exiftool location, write mode, timeouts)
//!     let config = Config::load(Some("config.json".as_ref()))?;
//!     let service = MetadataService::new(&config).await?;
//!
//!     let items = vec![
//!         MetadataUpdateItem::new("DSC0001.ARW")
//!             .with_rating(Rating::new(3).unwrap())
//!             .with_sharpness(512.33)
//!             .with_label(ColorLabel::Green),
//!         MetadataUpdateItem::new("DSC0002.JPG").with_caption("Kingfisher, perched"),
//!     ];
//!
//!     let report = service.write_batch(&items).await;
//!     for item in &report.items {
//!         println!("{}: {:?}", item.path.display(), item.outcome);
//!     }
//!     for path in report.failed_paths() {
//!         eprintln!("retry later: {}", path.display());
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Write Strategies
//!
//! | Format | Write Strategy |
//! |--------|---------------|
//! | Sony RAW (`.arw`) | Depends on [`config::WriteMode`]: embedded, in place, sidecar, or verified (auto) |
//! | Fujifilm/Olympus RAW (`.raf`, `.orf`) | Embedded, mirrored into a `.xmp` sidecar |
//! | Everything else | Embedded |
//!
//! In auto mode the fragile format is written to a trial copy first; the copy
//! replaces the original only if the offsets of the embedded previews and
//! image data did not move. Otherwise the original stays byte-identical and
//! the values go to the sidecar.
//!
//! ## Modules
//!
//! - [`config`] — Configuration types and loading/saving
//! - [`error`] — Error type of the write core
//! - [`exiftool`] — Process supervision and the `-stay_open` line protocol
//! - [`format`] — File kinds and sidecar naming
//! - [`item`] — Update items, per-item outcomes and batch results
//! - [`safe_write`] — Structural signatures and the verified write
//! - [`service`] — The metadata-write service (write, reset, read)
//! - [`sidecar`] — XMP sidecar writing and clearing

pub mod config;
pub mod error;
pub mod exiftool;
pub mod format;
pub mod item;
pub mod safe_write;
pub mod service;
pub mod sidecar;

pub use config::{Config, WriteMode};
pub use error::{Result, StampError};
pub use item::{BatchResult, ItemOutcome, MetadataUpdateItem, WriteReport};
pub use service::MetadataService;
