use serde_json::{Map, Value};
use std::path::Path;

use super::batch::CommandBatcher;
use super::coordinator::{ExecutionCoordinator, UnitOutput};
use crate::error::{Result, StampError};
use crate::item::{Field, FieldValues};

/// Read `tags` from `path` through the shared exiftool process.
///
/// Returns exiftool's JSON object for the file, keys without group prefix.
pub async fn read_tags(
    coordinator: &ExecutionCoordinator,
    batcher: &CommandBatcher,
    path: &Path,
    tags: &[&str],
    numeric: bool,
) -> Result<Map<String, Value>> {
    let unit = batcher.read_unit(path, tags, numeric)?;
    let outputs = coordinator.execute(std::slice::from_ref(&unit)).await?;
    let output = outputs.into_iter().next().ok_or_else(|| StampError::Unreadable {
        path: path.to_path_buf(),
        reason: "no output".into(),
    })?;
    parse_json_output(&output)
}

/// Parse the `-json` block of one unit into the object for its file.
pub fn parse_json_output(output: &UnitOutput) -> Result<Map<String, Value>> {
    let unreadable = |reason: String| StampError::Unreadable {
        path: output.target.clone(),
        reason,
    };

    let text = output.text();
    let start = text
        .find('[')
        .ok_or_else(|| unreadable(output.error().unwrap_or_else(|| "no JSON output".into())))?;
    let objects: Vec<Map<String, Value>> =
        serde_json::from_str(&text[start..]).map_err(|e| unreadable(e.to_string()))?;
    objects
        .into_iter()
        .next()
        .ok_or_else(|| unreadable("empty JSON array".into()))
}

/// The owned fields present in an exiftool JSON object.
pub fn owned_fields(tags: &Map<String, Value>) -> FieldValues {
    Field::ALL
        .iter()
        .filter_map(|field| {
            let value = value_text(tags.get(field.json_key())?)?;
            Some((*field, value))
        })
        .collect()
}

/// Textual form of a JSON tag value; `None` for null and empty strings.
pub fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Tag names to request for the owned fields.
pub fn owned_tags() -> Vec<&'static str> {
    Field::ALL.iter().map(|field| field.tag()).collect()
}
