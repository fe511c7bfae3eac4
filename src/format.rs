use std::path::{Path, PathBuf};

/// Extension of the sidecar written next to an original.
pub const SIDECAR_EXTENSION: &str = "xmp";

/// How a target file is treated, determined by its extension.
///
/// - **Fragile** (Sony `.arw`) breaks in the vendor viewer if an in-place
///   write shifts its internal layout. The configured
///   [`WriteMode`](crate::config::WriteMode) only applies to this kind.
/// - **Mirrored** (Fujifilm `.raf`, Olympus `.orf`) is written directly, and
///   the fields are mirrored into a sidecar because catalogs ignore XMP
///   embedded in these containers.
/// - **Standard** is everything else.
///
/// # Example
///
/// ```rust
/// use exif_stamp::format::FileKind;
/// use std::path::Path;
///
/// assert_eq!(FileKind::from_path(Path::new("DSC0001.ARW")), FileKind::Fragile);
/// assert_eq!(FileKind::from_path(Path::new("photo.jpg")), FileKind::Standard);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Fragile,
    Mirrored,
    Standard,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "arw" => Self::Fragile,
            "raf" | "orf" => Self::Mirrored,
            _ => Self::Standard,
        }
    }
}

/// Sidecar path for an original: same base name, `.xmp` extension.
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension(SIDECAR_EXTENSION)
}
