use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::Result;

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            let decoded = percent_decode_str(filename).decode_utf8_lossy();
            let sanitized = sanitize_filename(&decoded);
            if !sanitized.trim_matches(|c| c == '.' || c == '_').is_empty() {
                return Ok(sanitized);
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && !matches!(c, '.' | '-' | '_' | ' ' | '(' | ')' | '+'),
        "_",
    )
}

/// First free path among `name.ext`, `name (1).ext`, `name (2).ext`, ...
pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    if !path.exists() {
        return path;
    }

    let original = Path::new(filename);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let extension = original
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut counter = 1;
    while path.exists() {
        let new_filename = if extension.is_empty() {
            format!("{} ({})", stem, counter)
        } else {
            format!("{} ({}).{}", stem, counter, extension)
        };
        path = dir.join(new_filename);
        counter += 1;
    }
    path
}
