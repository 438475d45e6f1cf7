use qrscan_common::config::ExportFormat;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("nothing to export: no codes have been scanned")]
    NothingToExport,
    #[error("failed to write export {0}: {1}")]
    Io(String, std::io::Error),
}

/// Render `codes` as a single document.
///
/// An empty list is an explicit [`ExportError::NothingToExport`], never an
/// empty document.
pub fn render(codes: &[String], format: ExportFormat) -> Result<String, ExportError> {
    if codes.is_empty() {
        return Err(ExportError::NothingToExport);
    }

    let mut out = String::new();
    match format {
        ExportFormat::Text => {
            for code in codes {
                out.push_str(&text_line(code));
                out.push('\n');
            }
        }
        ExportFormat::Csv => {
            out.push_str("code\r\n");
            for code in codes {
                out.push_str(&csv_field(code));
                out.push_str("\r\n");
            }
        }
    }
    Ok(out)
}

/// Keep a code on a single line: backslash, `\n` and `\r` become backslash
/// escapes. Multi-line payloads (vCards, Wi-Fi configs) round-trip through
/// [`parse_text_line`].
fn text_line(code: &str) -> String {
    let mut line = String::with_capacity(code.len());
    for c in code.chars() {
        match c {
            '\\' => line.push_str("\\\\"),
            '\n' => line.push_str("\\n"),
            '\r' => line.push_str("\\r"),
            c => line.push(c),
        }
    }
    line
}

/// Inverse of the text export escaping for one line.
pub fn parse_text_line(line: &str) -> String {
    let mut code = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            code.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => code.push('\n'),
            Some('r') => code.push('\r'),
            Some(other) => code.push(other),
            None => code.push('\\'),
        }
    }
    code
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

/// File name for an export taken at `at_ms`.
/// e.g. "codes_20260218T093000000Z.txt"
pub fn export_file_name(at_ms: i64, format: ExportFormat) -> String {
    let dt = chrono::DateTime::from_timestamp_millis(at_ms).unwrap_or_else(chrono::Utc::now);
    format!(
        "codes_{ts}.{ext}",
        ts = dt.format("%Y%m%dT%H%M%S%3fZ"),
        ext = format.extension()
    )
}

/// Write `codes` to a timestamped file in `dir` and return its path.
/// No file is created when there is nothing to export.
pub fn write_export(
    dir: &Path,
    codes: &[String],
    format: ExportFormat,
    at_ms: i64,
) -> Result<PathBuf, ExportError> {
    let document = render(codes, format)?;
    std::fs::create_dir_all(dir).map_err(|e| ExportError::Io(dir.display().to_string(), e))?;
    let path = dir.join(export_file_name(at_ms, format));
    std::fs::write(&path, document)
        .map_err(|e| ExportError::Io(path.display().to_string(), e))?;
    info!(path = path.display().to_string(), codes = codes.len(), "codes exported");
    Ok(path)
}
