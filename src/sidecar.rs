//! XMP sidecar writing.
//!
//! Used when mutating the original is unsafe, disabled, or not read by
//! catalogs. The sidecar carries the same fields an embedded write would,
//! under the XMP properties exiftool maps those tags to, so a catalog sees
//! the same values either way. Content this crate does not own is preserved.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Result, StampError};
use crate::format::sidecar_path;
use crate::item::{Field, FieldValues, MetadataUpdateItem};

const NAMESPACES: [(&str, &str); 4] = [
    ("xmp", "http://ns.adobe.com/xap/1.0/"),
    ("xmpDM", "http://ns.adobe.com/xmp/1.0/DynamicMedia/"),
    ("photoshop", "http://ns.adobe.com/photoshop/1.0/"),
    ("dc", "http://purl.org/dc/elements/1.1/"),
];

/// XMP property for a field, and whether it is a language alternative.
fn property(field: Field) -> (&'static str, bool) {
    match field {
        Field::Rating => ("xmp:Rating", false),
        Field::Pick => ("xmpDM:pick", false),
        Field::Sharpness => ("photoshop:City", false),
        Field::AestheticScore => ("photoshop:State", false),
        Field::Label => ("xmp:Label", false),
        Field::FocusStatus => ("photoshop:Country", false),
        Field::Caption => ("dc:description", true),
        Field::Title => ("dc:title", true),
    }
}

/// Writes and clears `.xmp` sidecars next to originals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarWriter;

impl SidecarWriter {
    pub fn new() -> Self {
        Self
    }

    pub fn sidecar_path(&self, original: &Path) -> PathBuf {
        sidecar_path(original)
    }

    /// Write `item`'s fields to the sidecar of `item.path`, creating it if
    /// absent. Returns the sidecar path.
    pub fn write(&self, item: &MetadataUpdateItem) -> Result<PathBuf> {
        let path = sidecar_path(&item.path);
        let values: Vec<(Field, String)> = item
            .assignments()
            .into_iter()
            .map(|(field, value)| (field, value.as_str().to_string()))
            .collect();

        let xmp = if path.exists() {
            let existing = fs::read_to_string(&path)?;
            merge_into_xmp(&existing, &values).ok_or_else(|| {
                StampError::InvalidArgument(format!(
                    "existing sidecar is not an XMP packet: {}",
                    path.display()
                ))
            })?
        } else {
            build_xmp(&values)
        };

        write_atomic(&path, &xmp)?;
        log::debug!("Sidecar written: {} ({} field(s))", path.display(), values.len());
        Ok(path)
    }

    /// Update the sidecar of `item.path` with `item`'s fields only when one
    /// already exists. Returns the sidecar path when it was rewritten.
    ///
    /// Called after an embedded write, so an older sidecar never shadows the
    /// values just written.
    pub fn refresh(&self, item: &MetadataUpdateItem) -> Result<Option<PathBuf>> {
        if !sidecar_path(&item.path).exists() {
            return Ok(None);
        }
        self.write(item).map(Some)
    }

    /// Remove the owned fields from the sidecar of `original`.
    ///
    /// Returns `None` when there is no sidecar (nothing to do), otherwise the
    /// sidecar path. Foreign content stays untouched.
    pub fn clear(&self, original: &Path) -> Result<Option<PathBuf>> {
        let path = sidecar_path(original);
        if !path.exists() {
            return Ok(None);
        }

        let mut xmp = fs::read_to_string(&path)?;
        let mut changed = false;
        for field in Field::ALL {
            changed |= remove_property(&mut xmp, property(field).0);
        }
        if changed {
            write_atomic(&path, &xmp)?;
            log::debug!("Sidecar cleared: {}", path.display());
        }
        Ok(Some(path))
    }

    /// Owned fields present in the sidecar of `original`, if one exists.
    pub fn read(&self, original: &Path) -> Result<Option<FieldValues>> {
        let path = sidecar_path(original);
        if !path.exists() {
            return Ok(None);
        }
        let xmp = fs::read_to_string(&path)?;
        let values = Field::ALL
            .iter()
            .filter_map(|field| {
                let value = read_property(&xmp, property(*field).0)?;
                (!value.is_empty()).then_some((*field, value))
            })
            .collect();
        Ok(Some(values))
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn property_element(field: Field, value: &str) -> String {
    let (name, alt) = property(field);
    let escaped = xml_escape(value);
    if alt {
        format!("  <{name}><rdf:Alt><rdf:li xml:lang=\"x-default\">{escaped}</rdf:li></rdf:Alt></{name}>\n")
    } else {
        format!("  <{name}>{escaped}</{name}>\n")
    }
}

/// Build a fresh XMP packet holding `values`.
fn build_xmp(values: &[(Field, String)]) -> String {
    let mut xmp = String::new();
    xmp.push_str("<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n");
    xmp.push_str("<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n");
    xmp.push_str("<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n");
    xmp.push_str("<rdf:Description rdf:about=\"\"");
    for (prefix, uri) in NAMESPACES {
        xmp.push_str(&format!("\n  xmlns:{prefix}=\"{uri}\""));
    }
    xmp.push_str(">\n");

    for (field, value) in values {
        xmp.push_str(&property_element(*field, value));
    }

    xmp.push_str("</rdf:Description>\n");
    xmp.push_str("</rdf:RDF>\n");
    xmp.push_str("</x:xmpmeta>\n");
    xmp.push_str("<?xpacket end=\"w\"?>");
    xmp
}

/// Replace `values` in an existing packet. `None` if it is not XMP.
fn merge_into_xmp(existing: &str, values: &[(Field, String)]) -> Option<String> {
    let mut xmp = existing.to_string();
    if !xmp.contains("<rdf:RDF") {
        return None;
    }

    for (field, _) in values {
        remove_property(&mut xmp, property(*field).0);
    }

    open_description(&mut xmp)?;

    // Declare namespaces on the description that receives the new elements.
    let close = xmp.find("</rdf:Description>")?;
    let desc_start = xmp[..close].rfind("<rdf:Description")?;
    let tag_name_end = desc_start + "<rdf:Description".len();
    let header_end = desc_start + xmp[desc_start..].find('>')?;
    let header = xmp[desc_start..header_end].to_string();
    let mut declarations = String::new();
    for (prefix, uri) in NAMESPACES {
        if !header.contains(&format!("xmlns:{prefix}=")) {
            declarations.push_str(&format!("\n  xmlns:{prefix}=\"{uri}\""));
        }
    }
    xmp.insert_str(tag_name_end, &declarations);

    let mut elements = String::new();
    for (field, value) in values {
        elements.push_str(&property_element(*field, value));
    }
    let close = xmp.find("</rdf:Description>")?;
    xmp.insert_str(close, &elements);
    Some(xmp)
}

/// Make sure there is an `<rdf:Description>` with a closing tag.
fn open_description(xmp: &mut String) -> Option<()> {
    if xmp.contains("</rdf:Description>") {
        return Some(());
    }

    // Self-closing description: convert to open/close.
    if let Some(desc_start) = xmp.find("<rdf:Description") {
        let close_pos = desc_start + xmp[desc_start..].find("/>")?;
        xmp.replace_range(close_pos..close_pos + 2, ">");
        let rdf_end = xmp.find("</rdf:RDF>")?;
        xmp.insert_str(rdf_end, "</rdf:Description>\n");
        return Some(());
    }

    let rdf_end = xmp.find("</rdf:RDF>")?;
    xmp.insert_str(rdf_end, "<rdf:Description rdf:about=\"\">\n</rdf:Description>\n");
    Some(())
}

struct Element {
    start: usize,
    content: Option<(usize, usize)>,
    end: usize,
}

/// Find `<name ...>...</name>` or `<name .../>` at or after `from`.
fn find_element(xml: &str, name: &str, from: usize) -> Option<Element> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut search = from;
    while let Some(rel) = xml[search..].find(&open) {
        let start = search + rel;
        let after = start + open.len();
        let at_boundary = xml[after..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace());
        if !at_boundary {
            search = after;
            continue;
        }

        let tag_end = after + xml[after..].find('>')?;
        if xml[..tag_end].ends_with('/') {
            return Some(Element {
                start,
                content: None,
                end: tag_end + 1,
            });
        }
        let close_start = tag_end + xml[tag_end..].find(&close)?;
        return Some(Element {
            start,
            content: Some((tag_end + 1, close_start)),
            end: close_start + close.len(),
        });
    }
    None
}

/// Find ` name="value"` (either quote style). Returns (start, value range, end),
/// where `start` includes the whitespace before the name.
fn find_attribute(xml: &str, name: &str) -> Option<(usize, (usize, usize), usize)> {
    for quote in ['"', '\''] {
        let needle = format!("{name}={quote}");
        let mut search = 0;
        while let Some(rel) = xml[search..].find(&needle) {
            let at = search + rel;
            search = at + needle.len();
            let preceded_by_space = xml[..at].chars().next_back().is_some_and(char::is_whitespace);
            if !preceded_by_space {
                continue;
            }
            let value_start = at + needle.len();
            let Some(value_len) = xml[value_start..].find(quote) else {
                continue;
            };
            let value_end = value_start + value_len;
            let start = xml[..at].trim_end().len();
            return Some((start, (value_start, value_end), value_end + 1));
        }
    }
    None
}

/// Remove every occurrence of a property, element or attribute form.
/// Returns whether anything was removed.
fn remove_property(xml: &mut String, name: &str) -> bool {
    let mut removed = false;
    while let Some(element) = find_element(xml, name, 0) {
        // Also remove trailing newline if present
        let end = if xml.as_bytes().get(element.end) == Some(&b'\n') {
            element.end + 1
        } else {
            element.end
        };
        xml.replace_range(element.start..end, "");
        removed = true;
    }
    while let Some((start, _, end)) = find_attribute(xml, name) {
        xml.replace_range(start..end, "");
        removed = true;
    }
    removed
}

/// Value of a property, element or attribute form. Language alternatives
/// yield their first entry.
fn read_property(xml: &str, name: &str) -> Option<String> {
    if let Some(element) = find_element(xml, name, 0) {
        let (start, end) = element.content?;
        let content = &xml[start..end];
        let value = match find_element(content, "rdf:li", 0) {
            Some(li) => {
                let (li_start, li_end) = li.content?;
                &content[li_start..li_end]
            }
            None => content.trim(),
        };
        return Some(xml_unescape(value));
    }
    let (_, (start, end), _) = find_attribute(xml, name)?;
    Some(xml_unescape(&xml[start..end]))
}

/// Escape special XML characters.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
     .replace('<', "&lt;")
     .replace('>', "&gt;")
     .replace('"', "&quot;")
     .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
     .replace("&gt;", ">")
     .replace("&quot;", "\"")
     .replace("&apos;", "'")
     .replace("&#xA;", "\n")
     .replace("&amp;", "&")
}
