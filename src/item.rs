use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Star rating as written by the rating engine: -1 (rejected) through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct Rating(i8);

impl Rating {
    pub const MIN: i8 = -1;
    pub const MAX: i8 = 3;

    /// Returns `None` when `value` is outside `-1..=3`.
    pub fn new(value: i8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn value(self) -> i8 {
        self.0
    }
}

impl TryFrom<i8> for Rating {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| {
            format!("rating {value} out of range {}..={}", Self::MIN, Self::MAX)
        })
    }
}

impl From<Rating> for i8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// Pick flag (Lightroom convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Pick {
    Rejected,
    Unflagged,
    Picked,
}

impl Pick {
    pub fn value(self) -> i8 {
        match self {
            Self::Rejected => -1,
            Self::Unflagged => 0,
            Self::Picked => 1,
        }
    }
}

impl TryFrom<i8> for Pick {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Rejected),
            0 => Ok(Self::Unflagged),
            1 => Ok(Self::Picked),
            other => Err(format!("pick {other} is not one of -1, 0, 1")),
        }
    }
}

impl From<Pick> for i8 {
    fn from(pick: Pick) -> Self {
        pick.value()
    }
}

/// Color label understood by catalog software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorLabel {
    Red,
    Yellow,
    Green,
    Blue,
    Purple,
}

impl ColorLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "Red",
            Self::Yellow => "Yellow",
            Self::Green => "Green",
            Self::Blue => "Blue",
            Self::Purple => "Purple",
        }
    }
}

/// Focus assessment of the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FocusStatus {
    Best,
    Good,
    Bad,
    Worst,
}

impl FocusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "BEST",
            Self::Good => "GOOD",
            Self::Bad => "BAD",
            Self::Worst => "WORST",
        }
    }
}

/// A field this crate owns on a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Rating,
    Pick,
    Sharpness,
    AestheticScore,
    Label,
    FocusStatus,
    Caption,
    Title,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Rating,
        Field::Pick,
        Field::Sharpness,
        Field::AestheticScore,
        Field::Label,
        Field::FocusStatus,
        Field::Caption,
        Field::Title,
    ];

    /// exiftool tag the field is written to.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Rating => "Rating",
            Self::Pick => "XMP:Pick",
            Self::Sharpness => "XMP:City",
            Self::AestheticScore => "XMP:State",
            Self::Label => "XMP:Label",
            Self::FocusStatus => "XMP:Country",
            Self::Caption => "XMP:Description",
            Self::Title => "XMP:Title",
        }
    }

    /// Key of the field in exiftool's `-json` output (group prefix dropped).
    pub fn json_key(self) -> &'static str {
        let tag = self.tag();
        tag.rsplit(':').next().unwrap_or(tag)
    }

    /// Free-text fields are passed through scratch files, never inline.
    pub fn is_free_text(self) -> bool {
        matches!(self, Self::Caption | Self::Title)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.json_key())
    }
}

/// Value to assign to a field, already formatted for the target tag.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Inline(String),
    Text(&'a str),
}

impl FieldValue<'_> {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline(value) => value,
            Self::Text(text) => text,
        }
    }
}

/// Owned field values read back from a file or sidecar.
pub type FieldValues = BTreeMap<Field, String>;

/// Per-photo update produced upstream. Absent fields are left untouched.
///
/// # Example
///
/// ```rust
/// use exif_stamp::item::{MetadataUpdateItem, Pick, Rating};
///
/// let item = MetadataUpdateItem::new("a.raw")
///     .with_rating(Rating::new(3).unwrap())
///     .with_pick(Pick::Picked)
///     .with_sharpness(512.33);
/// assert_eq!(item.assignments().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataUpdateItem {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<Pick>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aesthetic_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<ColorLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_status: Option<FocusStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MetadataUpdateItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_rating(mut self, rating: Rating) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_pick(mut self, pick: Pick) -> Self {
        self.pick = Some(pick);
        self
    }

    pub fn with_sharpness(mut self, sharpness: f64) -> Self {
        self.sharpness = Some(sharpness);
        self
    }

    pub fn with_aesthetic_score(mut self, score: f64) -> Self {
        self.aesthetic_score = Some(score);
        self
    }

    pub fn with_label(mut self, label: ColorLabel) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_focus_status(mut self, status: FocusStatus) -> Self {
        self.focus_status = Some(status);
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The present fields, in tag order, formatted for writing.
    ///
    /// Sharpness is zero-padded to six characters and the aesthetic score to
    /// five so downstream tools sort them correctly as text. A non-finite
    /// score is left out.
    pub fn assignments(&self) -> Vec<(Field, FieldValue<'_>)> {
        let Self {
            path: _,
            rating,
            pick,
            sharpness,
            aesthetic_score,
            label,
            focus_status,
            caption,
            title,
        } = self;

        let mut out = Vec::new();
        if let Some(rating) = rating {
            out.push((Field::Rating, FieldValue::Inline(rating.value().to_string())));
        }
        if let Some(pick) = pick {
            out.push((Field::Pick, FieldValue::Inline(pick.value().to_string())));
        }
        if let Some(sharpness) = sharpness.filter(|v| v.is_finite()) {
            out.push((Field::Sharpness, FieldValue::Inline(format!("{sharpness:06.2}"))));
        }
        if let Some(score) = aesthetic_score.filter(|v| v.is_finite()) {
            out.push((Field::AestheticScore, FieldValue::Inline(format!("{score:05.2}"))));
        }
        if let Some(label) = label {
            out.push((Field::Label, FieldValue::Inline(label.as_str().to_string())));
        }
        if let Some(status) = focus_status {
            out.push((Field::FocusStatus, FieldValue::Inline(status.as_str().to_string())));
        }
        if let Some(caption) = caption {
            out.push((Field::Caption, FieldValue::Text(caption)));
        }
        if let Some(title) = title {
            out.push((Field::Title, FieldValue::Text(title)));
        }
        out
    }

    /// `true` when the item carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.assignments().is_empty()
    }
}

/// Aggregate counts for one call. `success + failed` always equals the number
/// of items submitted to that call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    pub fn all_failed(units: usize) -> Self {
        Self {
            success: 0,
            failed: units,
        }
    }
}

/// What happened to one submitted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Written directly into the file.
    Embedded,
    /// Written to a verified copy that replaced the original.
    Committed,
    /// Written to (or cleared from) the sidecar at this path.
    Sidecar(PathBuf),
    /// The item carried no fields; nothing was sent.
    Unchanged,
    Failed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub path: PathBuf,
    pub outcome: ItemOutcome,
}

/// Per-item report for one write or reset call, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub result: BatchResult,
    pub items: Vec<ItemReport>,
}

impl WriteReport {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            result: BatchResult::default(),
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, path: impl Into<PathBuf>, outcome: ItemOutcome) {
        if outcome.is_success() {
            self.result.success += 1;
        } else {
            self.result.failed += 1;
        }
        self.items.push(ItemReport {
            path: path.into(),
            outcome,
        });
    }

    pub fn extend(&mut self, other: WriteReport) {
        for item in other.items {
            self.push(item.path, item.outcome);
        }
    }

    /// Paths whose update failed, for a targeted retry.
    pub fn failed_paths(&self) -> Vec<&Path> {
        self.items
            .iter()
            .filter(|item| !item.outcome.is_success())
            .map(|item| item.path.as_path())
            .collect()
    }

    /// Sidecars written or cleared by this call.
    pub fn sidecars(&self) -> Vec<&Path> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                ItemOutcome::Sidecar(path) => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }
}
