use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};

use crate::error::{Result, StampError};
use crate::item::{Field, FieldValue, MetadataUpdateItem};

/// Ends one unit; exiftool answers with `{readyN}`.
pub const EXECUTE_MARKER: &str = "-execute";

/// Suffix exiftool appends to a target while rewriting it. A leftover one
/// makes exiftool refuse to touch the target.
pub const IN_PROGRESS_SUFFIX: &str = "_exiftool_tmp";

/// Legacy IPTC location fields an older writer used for the same values.
const LEGACY_IPTC_TAGS: [&str; 3] = [
    "IPTC:City",
    "IPTC:Country-PrimaryLocationName",
    "IPTC:Province-State",
];

/// How exiftool replaces the target after writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Write a new file and rename it over the original.
    Replace,
    /// Copy the new content back into the original file, keeping its identity.
    InPlace,
}

impl Overwrite {
    fn flag(self) -> &'static str {
        match self {
            Self::Replace => "-overwrite_original",
            Self::InPlace => "-overwrite_original_in_place",
        }
    }
}

/// One execute-delimited unit of arguments, targeting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    target: PathBuf,
    args: Vec<String>,
}

impl Unit {
    /// Build a unit whose last argument is `target`.
    ///
    /// Fails when any argument (the path included) contains a line break,
    /// which the line protocol cannot carry.
    pub fn new(target: &Path, mut args: Vec<String>) -> Result<Self> {
        let path_arg = target
            .to_str()
            .ok_or_else(|| {
                StampError::InvalidArgument(format!("path is not UTF-8: {}", target.display()))
            })?
            .to_string();
        args.push(path_arg);

        if let Some(bad) = args.iter().find(|arg| arg.contains(['\n', '\r'])) {
            return Err(StampError::InvalidArgument(format!(
                "argument contains a line break: {bad:?}"
            )));
        }

        Ok(Self {
            target: target.to_path_buf(),
            args,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Append this unit to `script`, terminated by the numbered execute marker.
    pub(crate) fn render(&self, seq: u64, script: &mut String) {
        for arg in &self.args {
            script.push_str(arg);
            script.push('\n');
        }
        script.push_str(EXECUTE_MARKER);
        script.push_str(&seq.to_string());
        script.push('\n');
    }
}

/// Scratch files holding free-text values for one batch.
///
/// Every file is deleted when the set is dropped, whether the batch
/// succeeded, partly failed, or bailed out early.
#[derive(Debug, Default)]
pub struct ScratchFiles {
    files: Vec<NamedTempFile>,
}

impl ScratchFiles {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(NamedTempFile::path)
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        let count = self.files.len();
        for file in self.files.drain(..) {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                log::warn!("Failed to remove scratch file {}: {e}", path.display());
            }
        }
        if count > 0 {
            log::debug!("Removed {count} scratch file(s)");
        }
    }
}

/// Turns update items into protocol units.
#[derive(Debug, Clone, Default)]
pub struct CommandBatcher {
    scratch_dir: Option<PathBuf>,
}

impl CommandBatcher {
    pub fn new(scratch_dir: Option<PathBuf>) -> Self {
        Self { scratch_dir }
    }

    /// Unit writing `item`'s fields to `target` (normally `item.path`, or a
    /// trial copy of it).
    ///
    /// Captions and titles are written to scratch files registered in
    /// `scratch`; the unit only references them.
    pub fn write_unit(
        &self,
        item: &MetadataUpdateItem,
        target: &Path,
        overwrite: Overwrite,
        scratch: &mut ScratchFiles,
    ) -> Result<Unit> {
        let mut args = vec!["-charset".to_string(), "utf8".to_string()];
        for (field, value) in item.assignments() {
            match value {
                FieldValue::Inline(value) => args.push(format!("-{}={value}", field.tag())),
                FieldValue::Text(text) => {
                    let file = self.scratch_file(field, text)?;
                    args.push(format!("-{}<={}", field.tag(), file.path().display()));
                    scratch.files.push(file);
                }
            }
        }
        args.push(overwrite.flag().to_string());
        Unit::new(target, args)
    }

    /// Unit clearing every owned field (and the legacy IPTC copies) on `target`.
    pub fn clear_unit(&self, target: &Path, overwrite: Overwrite) -> Result<Unit> {
        let mut args = vec!["-charset".to_string(), "utf8".to_string()];
        args.extend(Field::ALL.iter().map(|field| format!("-{}=", field.tag())));
        args.extend(LEGACY_IPTC_TAGS.iter().map(|tag| format!("-{tag}=")));
        args.push(overwrite.flag().to_string());
        args.push("-ignoreMinorErrors".to_string());
        Unit::new(target, args)
    }

    /// Unit printing `tags` of `target` as JSON. `numeric` disables print
    /// conversion so raw values come back.
    pub fn read_unit(&self, target: &Path, tags: &[&str], numeric: bool) -> Result<Unit> {
        let mut args = vec!["-json".to_string()];
        if numeric {
            args.push("-n".to_string());
        }
        args.extend(tags.iter().map(|tag| format!("-{tag}")));
        Unit::new(target, args)
    }

    fn scratch_file(&self, field: Field, text: &str) -> Result<NamedTempFile> {
        let prefix = format!("exif-stamp-{}-", field.json_key().to_lowercase());
        let mut builder = Builder::new();
        builder.prefix(&prefix).suffix(".txt");
        let mut file = match self.scratch_dir {
            Some(ref dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// Path of the in-progress artifact exiftool would leave next to `path`.
pub fn in_progress_artifact(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(IN_PROGRESS_SUFFIX);
    PathBuf::from(name)
}

/// Delete in-progress artifacts left by a crashed run for any of `paths`.
/// Returns how many were removed.
pub fn remove_stale_artifacts<'a, I>(paths: I) -> usize
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut removed = 0;
    for path in paths {
        let artifact = in_progress_artifact(path);
        if !artifact.exists() {
            continue;
        }
        match std::fs::remove_file(&artifact) {
            Ok(()) => {
                log::warn!("Removed stale exiftool artifact: {}", artifact.display());
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove stale artifact {}: {e}", artifact.display()),
        }
    }
    removed
}
